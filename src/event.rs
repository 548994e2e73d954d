// COLOCATE EVENT LOG
// APPEND-ONLY RECORD OF EVERY SCHEDULING DECISION, ONE LINE PER EVENT:
//
//   TIMESTAMP EVENT JOB ARGS
//
// start         [c,c,...] THREADS   (NO ARGS FOR THE SCHEDULER ITSELF)
// update_cores  [c,c,...]
// custom        PERCENT-ENCODED TEXT
// end/pause/unpause  NO ARGS
//
// EVERY LINE WRITTEN PARSES BACK INTO THE SAME Event.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;

use chrono::{NaiveDateTime, SubsecRound};
use regex::Regex;

use crate::cores::CoreSet;
use crate::error::{SchedError, SchedResult};
use crate::job::JobName;

pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum EventKind {
    Start,
    End,
    Pause,
    Unpause,
    UpdateCores,
    Custom,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::UpdateCores => "update_cores",
            Self::Custom => "custom",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "start" => Self::Start,
            "end" => Self::End,
            "pause" => Self::Pause,
            "unpause" => Self::Unpause,
            "update_cores" => Self::UpdateCores,
            "custom" => Self::Custom,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Subject {
    Scheduler,
    Memcached,
    Job(JobName),
}

impl Subject {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Memcached => "memcached",
            Self::Job(j) => j.as_str(),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduler" => Some(Self::Scheduler),
            "memcached" => Some(Self::Memcached),
            other => other.parse().ok().map(Self::Job),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EventArgs {
    None,
    Start { cores: CoreSet, threads: u32 },
    Cores(CoreSet),
    Text(String),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Event {
    pub timestamp: NaiveDateTime,
    pub kind: EventKind,
    pub subject: Subject,
    pub args: EventArgs,
}

// MICROSECOND RESOLUTION: WHAT THE LINE FORMAT CAN CARRY
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local().trunc_subsecs(6)
}

impl Event {
    pub fn new(timestamp: NaiveDateTime, kind: EventKind, subject: Subject, args: EventArgs) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(6),
            kind,
            subject,
            args,
        }
    }

    pub fn job(&self) -> Option<JobName> {
        match self.subject {
            Subject::Job(j) => Some(j),
            _ => None,
        }
    }

    pub fn parse(line: &str) -> SchedResult<Self> {
        static LINE: OnceLock<Regex> = OnceLock::new();
        static START: OnceLock<Regex> = OnceLock::new();
        let line_re = LINE.get_or_init(|| {
            Regex::new(r"^(\S+) (\S+) (\S+)(?: (\S.*))?$").expect("static regex")
        });
        let start_re = START.get_or_init(|| {
            Regex::new(r"^(\[[0-9,]*\]) ([0-9]+)$").expect("static regex")
        });

        let bad = || SchedError::MalformedEvent(line.to_string());
        let caps = line_re.captures(line.trim_end()).ok_or_else(bad)?;
        let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIME_FORMAT).map_err(|_| bad())?;
        let kind = EventKind::parse(&caps[2]).ok_or_else(bad)?;
        let subject = Subject::parse(&caps[3]).ok_or_else(bad)?;
        let raw_args = caps.get(4).map(|m| m.as_str());

        let args = match (kind, raw_args) {
            (EventKind::Start, Some(a)) => {
                let c = start_re.captures(a).ok_or_else(bad)?;
                EventArgs::Start {
                    cores: c[1].parse().map_err(|_| bad())?,
                    threads: c[2].parse().map_err(|_| bad())?,
                }
            }
            (EventKind::UpdateCores, Some(a)) => EventArgs::Cores(a.parse().map_err(|_| bad())?),
            (EventKind::Custom, Some(a)) => {
                EventArgs::Text(urlencoding::decode(a).map_err(|_| bad())?.into_owned())
            }
            (EventKind::Custom, None) => EventArgs::Text(String::new()),
            (EventKind::Start | EventKind::End | EventKind::Pause | EventKind::Unpause, None) => {
                EventArgs::None
            }
            _ => return Err(bad()),
        };
        Ok(Self { timestamp, kind, subject, args })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.format(TIME_FORMAT),
            self.kind.as_str(),
            self.subject
        )?;
        match &self.args {
            EventArgs::None => Ok(()),
            EventArgs::Start { cores, threads } => write!(f, " {} {}", cores, threads),
            EventArgs::Cores(cores) => write!(f, " {}", cores),
            EventArgs::Text(t) if t.is_empty() => Ok(()),
            EventArgs::Text(t) => write!(f, " {}", urlencoding::encode(t)),
        }
    }
}

// --- LOG ---

pub struct EventLog {
    sink: Option<BufWriter<File>>,
    events: Vec<Event>,
}

impl EventLog {
    // IN-MEMORY ONLY
    pub fn new() -> Self {
        Self {
            sink: None,
            events: Vec::new(),
        }
    }

    pub fn create(path: &Path) -> SchedResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Some(BufWriter::new(file)),
            events: Vec::new(),
        })
    }

    // ONLY THE TYPED EMITTERS BELOW BUILD EVENTS, SO EVERY LINE PARSES BACK
    fn record(&mut self, event: Event) -> SchedResult<()> {
        if let Some(sink) = self.sink.as_mut() {
            writeln!(sink, "{}", event)?;
        }
        self.events.push(event);
        Ok(())
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn flush(&mut self) -> SchedResult<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    // --- TYPED EMITTERS ---

    pub fn scheduler_start(&mut self) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::Start, Subject::Scheduler, EventArgs::None))
    }

    pub fn scheduler_end(&mut self) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::End, Subject::Scheduler, EventArgs::None))?;
        self.flush()
    }

    pub fn job_start(&mut self, job: JobName, cores: CoreSet, threads: u32) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::Start, Subject::Job(job), EventArgs::Start { cores, threads }))
    }

    pub fn job_end(&mut self, job: JobName) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::End, Subject::Job(job), EventArgs::None))
    }

    pub fn pause(&mut self, job: JobName) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::Pause, Subject::Job(job), EventArgs::None))
    }

    pub fn unpause(&mut self, job: JobName) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::Unpause, Subject::Job(job), EventArgs::None))
    }

    pub fn update_cores(&mut self, subject: Subject, cores: CoreSet) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::UpdateCores, subject, EventArgs::Cores(cores)))
    }

    pub fn custom(&mut self, subject: Subject, text: &str) -> SchedResult<()> {
        self.record(Event::new(now(), EventKind::Custom, subject, EventArgs::Text(text.to_string())))
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// --- REPLAY ---

pub fn read_log(path: &Path) -> SchedResult<Vec<Event>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(Event::parse(&line)?);
    }
    Ok(events)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobTimeline {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub pauses: u32,
    pub core_updates: u32,
    pub paused_secs: f64,
}

impl JobTimeline {
    pub fn runtime_secs(&self) -> Option<f64> {
        let d = self.end? - self.start?;
        Some(d.num_milliseconds() as f64 / 1000.0)
    }
}

// PER-JOB START/END/PAUSE ACCOUNTING FROM A PARSED LOG
pub fn timelines(events: &[Event]) -> Vec<(JobName, JobTimeline)> {
    let mut out: Vec<(JobName, JobTimeline)> = JobName::ALL
        .iter()
        .map(|&j| (j, JobTimeline::default()))
        .collect();
    let mut paused_at: [Option<NaiveDateTime>; crate::job::NR_JOBS] = [None; crate::job::NR_JOBS];

    for e in events {
        let Some(job) = e.job() else { continue };
        let t = &mut out[job as usize].1;
        match e.kind {
            EventKind::Start => t.start = Some(e.timestamp),
            EventKind::End => {
                t.end = Some(e.timestamp);
                if let Some(p) = paused_at[job as usize].take() {
                    t.paused_secs += (e.timestamp - p).num_milliseconds() as f64 / 1000.0;
                }
            }
            EventKind::Pause => {
                t.pauses += 1;
                paused_at[job as usize] = Some(e.timestamp);
            }
            EventKind::Unpause => {
                if let Some(p) = paused_at[job as usize].take() {
                    t.paused_secs += (e.timestamp - p).num_milliseconds() as f64 / 1000.0;
                }
            }
            EventKind::UpdateCores => t.core_updates += 1,
            EventKind::Custom => {}
        }
    }
    out
}
