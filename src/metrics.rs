// COLOCATE METRICS SOURCE
// ONE sample() PER TICK. EVERY READING IN A SAMPLE COMES FROM THE SAME
// OBSERVATION WINDOW, SO A TICK NEVER MIXES FRESH AND STALE COUNTERS.

use std::collections::VecDeque;
use std::fs;
use std::time::{Duration, Instant};

use crate::cores::NR_CORES;
use crate::error::{SchedError, SchedResult};
use crate::load::DemandModel;

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub per_core_cpu: [f64; NR_CORES],
    pub service_cpu_percent: f64,
    pub memory_percent: f64,
    pub net_recv_delta: u64,
    pub elapsed: Duration,
}

impl Sample {
    pub fn packets_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return f64::NAN;
        }
        self.net_recv_delta as f64 / secs
    }

    pub fn validate(self) -> SchedResult<Self> {
        let finite = self.per_core_cpu.iter().all(|v| v.is_finite())
            && self.service_cpu_percent.is_finite()
            && self.memory_percent.is_finite();
        if !finite {
            return Err(SchedError::MetricsUnavailable(format!(
                "non-finite reading: cpu={:?} service={} mem={}",
                self.per_core_cpu, self.service_cpu_percent, self.memory_percent
            )));
        }
        if self.elapsed.is_zero() {
            return Err(SchedError::MetricsUnavailable("zero-length sampling window".into()));
        }
        Ok(self)
    }
}

pub trait MetricsSource {
    // MAY BLOCK FOR ONE SAMPLING WINDOW
    fn sample(&mut self) -> SchedResult<Sample>;
}

// --- /proc PARSERS ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

// PER-CPU LINES ONLY ("cpuN ..."), AGGREGATE "cpu " LINE SKIPPED
pub fn parse_proc_stat(raw: &str) -> Vec<CpuTimes> {
    let mut cpus = Vec::new();
    for line in raw.lines() {
        if !line.starts_with("cpu") || line.starts_with("cpu ") {
            continue;
        }
        let fields: Vec<u64> = line.split_whitespace()
            .skip(1)
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 4 {
            continue;
        }
        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        cpus.push(CpuTimes { idle, total });
    }
    cpus
}

pub fn busy_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle);
    (total.saturating_sub(idle)) as f64 / total as f64 * 100.0
}

// utime + stime IN CLOCK TICKS. comm MAY CONTAIN SPACES AND PARENS,
// SO FIELDS ARE COUNTED FROM THE LAST ')'.
pub fn parse_pid_stat(raw: &str) -> Option<u64> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest STARTS AT FIELD 3 (state); utime IS FIELD 14, stime 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

// RECEIVED PACKETS SUMMED OVER ALL INTERFACES EXCEPT LOOPBACK
pub fn parse_net_dev(raw: &str) -> u64 {
    raw.lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, counters) = line.split_once(':')?;
            if iface.trim() == "lo" {
                return None;
            }
            counters.split_whitespace().nth(1)?.parse::<u64>().ok()
        })
        .sum()
}

pub fn parse_meminfo(raw: &str) -> Option<f64> {
    let field = |key: &str| -> Option<f64> {
        raw.lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

// --- PROCFS SOURCE ---

pub struct ProcMetrics {
    service_pid: Option<i32>,
    window: Duration,
    clk_tck: f64,
    last_net: u64,
    last_at: Instant,
}

impl ProcMetrics {
    pub fn new(model: DemandModel, service_pid: Option<i32>, window: Duration) -> SchedResult<Self> {
        // WITHOUT A PID THE CPU MODEL WOULD READ 0% AND PIN THE LEVEL TO LOW
        if model == DemandModel::Cpu && service_pid.is_none() {
            return Err(SchedError::Configuration("the cpu demand model needs --service-pid".into()));
        }
        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if clk_tck <= 0 {
            return Err(SchedError::Configuration("sysconf(_SC_CLK_TCK) failed".into()));
        }
        Ok(Self {
            service_pid,
            window,
            clk_tck: clk_tck as f64,
            last_net: read_net_packets()?,
            last_at: Instant::now(),
        })
    }

    fn service_ticks(&self) -> SchedResult<Option<u64>> {
        let Some(pid) = self.service_pid else {
            return Ok(None);
        };
        let raw = read(&format!("/proc/{}/stat", pid))?;
        parse_pid_stat(&raw)
            .map(Some)
            .ok_or_else(|| SchedError::MetricsUnavailable(format!("unparsable /proc/{}/stat", pid)))
    }
}

impl MetricsSource for ProcMetrics {
    fn sample(&mut self) -> SchedResult<Sample> {
        let cpu_before = parse_proc_stat(&read("/proc/stat")?);
        let svc_before = self.service_ticks()?;
        let window_start = Instant::now();

        std::thread::sleep(self.window);

        let cpu_after = parse_proc_stat(&read("/proc/stat")?);
        let svc_after = self.service_ticks()?;
        let window_secs = window_start.elapsed().as_secs_f64();
        let memory_percent = parse_meminfo(&read("/proc/meminfo")?)
            .ok_or_else(|| SchedError::MetricsUnavailable("unparsable /proc/meminfo".into()))?;
        let net = read_net_packets()?;
        let now = Instant::now();

        if cpu_after.len() < NR_CORES || cpu_before.len() < NR_CORES {
            return Err(SchedError::MetricsUnavailable(format!(
                "/proc/stat lists {} cpus, need {}", cpu_after.len(), NR_CORES
            )));
        }
        let mut per_core_cpu = [0.0; NR_CORES];
        for (i, slot) in per_core_cpu.iter_mut().enumerate() {
            *slot = busy_percent(cpu_before[i], cpu_after[i]);
        }

        // PERCENT OF ONE CORE, MAY EXCEED 100 WITH SEVERAL THREADS
        let service_cpu_percent = match (svc_before, svc_after) {
            (Some(a), Some(b)) if window_secs > 0.0 => {
                b.saturating_sub(a) as f64 / self.clk_tck / window_secs * 100.0
            }
            _ => 0.0,
        };

        let sample = Sample {
            per_core_cpu,
            service_cpu_percent,
            memory_percent,
            net_recv_delta: net.saturating_sub(self.last_net),
            elapsed: now - self.last_at,
        };
        self.last_net = net;
        self.last_at = now;
        sample.validate()
    }
}

fn read(path: &str) -> SchedResult<String> {
    fs::read_to_string(path)
        .map_err(|e| SchedError::MetricsUnavailable(format!("{}: {}", path, e)))
}

fn read_net_packets() -> SchedResult<u64> {
    Ok(parse_net_dev(&read("/proc/net/dev")?))
}

// --- SCRIPTED SOURCE ---

// REPLAYS A FIXED SEQUENCE. None ENTRIES FAIL THAT TICK.
// ONCE EXHAUSTED THE LAST SAMPLE REPEATS FOREVER.
pub struct ScriptedMetrics {
    script: VecDeque<Option<Sample>>,
    last: Option<Sample>,
}

impl ScriptedMetrics {
    pub fn new(script: Vec<Option<Sample>>) -> Self {
        Self {
            script: script.into(),
            last: None,
        }
    }

    // ONE-SECOND SAMPLES WHOSE METRIC PREDICTS EXACTLY THE GIVEN DEMAND
    pub fn from_demands(model: DemandModel, demands: &[f64]) -> Self {
        Self::new(demands.iter().map(|&qps| Some(synthetic_sample(model, qps))).collect())
    }

    pub fn push(&mut self, sample: Option<Sample>) {
        self.script.push_back(sample);
    }
}

pub fn synthetic_sample(model: DemandModel, qps: f64) -> Sample {
    let metric = model.metric_for_demand(qps).max(0.0);
    let (net_recv_delta, service_cpu_percent) = match model {
        DemandModel::Net => (metric.round() as u64, 0.0),
        DemandModel::Cpu => (0, metric),
    };
    Sample {
        per_core_cpu: [0.0; NR_CORES],
        service_cpu_percent,
        memory_percent: 0.0,
        net_recv_delta,
        elapsed: Duration::from_secs(1),
    }
}

impl MetricsSource for ScriptedMetrics {
    fn sample(&mut self) -> SchedResult<Sample> {
        match self.script.pop_front() {
            Some(Some(s)) => {
                self.last = Some(s.clone());
                s.validate()
            }
            Some(None) => Err(SchedError::MetricsUnavailable("scripted failure".into())),
            None => self
                .last
                .clone()
                .ok_or_else(|| SchedError::MetricsUnavailable("empty script".into())),
        }
    }
}
