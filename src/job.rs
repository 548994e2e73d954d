// COLOCATE JOB REGISTRY
// SEVEN KNOWN BATCH JOBS, FIXED AT STARTUP. ONLY STATUS, CORES AND
// TIMESTAMPS MUTATE. OWNED BY THE CONTROL LOOP, LENT TO THE POLICY.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;

use crate::cores::{CoreSet, NR_CORES};
use crate::error::{SchedError, SchedResult};

pub const NR_JOBS: usize = 7;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum JobName {
    Blackscholes = 0,
    Canneal = 1,
    Dedup = 2,
    Ferret = 3,
    Freqmine = 4,
    Radix = 5,
    Vips = 6,
}

impl JobName {
    pub const ALL: [JobName; NR_JOBS] = [
        Self::Blackscholes,
        Self::Canneal,
        Self::Dedup,
        Self::Ferret,
        Self::Freqmine,
        Self::Radix,
        Self::Vips,
    ];

    // MINI JOBS IN ROTATION ORDER
    pub const MINI: [JobName; 2] = [Self::Radix, Self::Dedup];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blackscholes => "blackscholes",
            Self::Canneal => "canneal",
            Self::Dedup => "dedup",
            Self::Ferret => "ferret",
            Self::Freqmine => "freqmine",
            Self::Radix => "radix",
            Self::Vips => "vips",
        }
    }

    pub fn suite(self) -> &'static str {
        match self {
            Self::Radix => "splash2x",
            _ => "parsec",
        }
    }

    pub fn is_mini(self) -> bool {
        matches!(self, Self::Radix | Self::Dedup)
    }

    pub fn threads(self) -> u32 {
        match self {
            Self::Radix | Self::Dedup => 1,
            Self::Blackscholes | Self::Vips => 2,
            Self::Canneal | Self::Ferret | Self::Freqmine => 3,
        }
    }

    // WHERE A JOB LANDS THE MOMENT IT STARTS, BEFORE THE FIRST ALLOCATION
    pub fn initial_cores(self) -> CoreSet {
        match self {
            Self::Radix | Self::Dedup => CoreSet::of(&[1]),
            Self::Blackscholes => CoreSet::of(&[2]),
            Self::Vips => CoreSet::of(&[3]),
            Self::Canneal | Self::Ferret | Self::Freqmine => CoreSet::of(&[2, 3]),
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|j| j.as_str() == s)
            .ok_or_else(|| SchedError::Configuration(format!("unknown job {:?}", s)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JobStatus {
    NotCreated,
    Running,
    Paused,
    Exited,
}

impl JobStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::NotCreated => "not-created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exited => "exited",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Job {
    pub name: JobName,
    pub threads: u32,
    pub status: JobStatus,
    pub cores: CoreSet,
    // None UNTIL THE BACKEND CONFIRMED A QUOTA FOR THE CURRENT CORES
    pub quota: Option<f64>,
    pub started_at: Option<NaiveDateTime>,
    pub ended_at: Option<NaiveDateTime>,
    pub acknowledged: bool,
}

impl Job {
    fn new(name: JobName) -> Self {
        Self {
            name,
            threads: name.threads(),
            status: JobStatus::NotCreated,
            cores: CoreSet::EMPTY,
            quota: None,
            started_at: None,
            ended_at: None,
            acknowledged: false,
        }
    }

    // CORE SET IS EMPTY IFF THE JOB IS NOT RUNNING
    pub fn consistent(&self) -> bool {
        (self.status == JobStatus::Running) == !self.cores.is_empty()
    }

    pub fn runtime_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at?;
        Some((end - start).num_microseconds()? as f64 / 1_000_000.0)
    }
}

pub struct JobRegistry {
    jobs: Vec<Job>,
    service: CoreSet,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: JobName::ALL.iter().map(|&n| Job::new(n)).collect(),
            service: CoreSet::EMPTY,
        }
    }

    pub fn get(&self, name: JobName) -> &Job {
        &self.jobs[name as usize]
    }

    pub fn get_mut(&mut self, name: JobName) -> &mut Job {
        &mut self.jobs[name as usize]
    }

    pub fn lookup(&self, name: &str) -> SchedResult<&Job> {
        let name: JobName = name.parse()?;
        Ok(self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn status(&self, name: JobName) -> JobStatus {
        self.get(name).status
    }

    pub fn service_cores(&self) -> CoreSet {
        self.service
    }

    pub fn set_service_cores(&mut self, cores: CoreSet) {
        self.service = cores;
    }

    pub fn all_exited(&self) -> bool {
        self.jobs.iter().all(|j| j.status == JobStatus::Exited)
    }

    // --- LIFECYCLE TRANSITIONS ---

    pub fn mark_started(&mut self, name: JobName, cores: CoreSet, at: NaiveDateTime) {
        let job = self.get_mut(name);
        job.status = JobStatus::Running;
        job.quota = Some(cores.len() as f64);
        job.cores = cores;
        job.started_at = Some(at);
    }

    pub fn mark_paused(&mut self, name: JobName) {
        let job = self.get_mut(name);
        job.status = JobStatus::Paused;
        job.cores = CoreSet::EMPTY;
        job.quota = None;
    }

    pub fn mark_running(&mut self, name: JobName, cores: CoreSet, quota: f64) {
        let job = self.get_mut(name);
        job.status = JobStatus::Running;
        job.cores = cores;
        job.quota = Some(quota);
    }

    // RESUMED BUT NOT YET RE-PINNED: THE NEXT APPLY RETRIES THE UPDATE
    pub fn mark_unpaused(&mut self, name: JobName, cores: CoreSet) {
        let job = self.get_mut(name);
        job.status = JobStatus::Running;
        job.cores = cores;
        job.quota = None;
    }

    pub fn mark_exited(&mut self, name: JobName, at: NaiveDateTime) {
        let job = self.get_mut(name);
        job.status = JobStatus::Exited;
        job.cores = CoreSet::EMPTY;
        job.quota = None;
        if job.ended_at.is_none() {
            job.ended_at = Some(at);
        }
    }

    // FIRST CHECK ACROSS ALL JOBS: RUNNING <=> NON-EMPTY CORE SET
    pub fn check_invariants(&self) -> SchedResult<()> {
        for job in &self.jobs {
            if !job.consistent() {
                return Err(SchedError::InvariantViolation(format!(
                    "{} is {} with cores {}",
                    job.name, job.status.label(), job.cores
                )));
            }
        }
        Ok(())
    }

    // JOB NAMES PER CORE, PIPE-JOINED WHEN SHARED. EMPTY STRING FOR IDLE.
    pub fn occupants(&self) -> [String; NR_CORES] {
        let mut per_core: [Vec<&str>; NR_CORES] = Default::default();
        for job in &self.jobs {
            if job.status != JobStatus::Running {
                continue;
            }
            for core in job.cores.iter() {
                per_core[core as usize].push(job.name.as_str());
            }
        }
        per_core.map(|names| names.join("|"))
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> NaiveDateTime {
        chrono::DateTime::from_timestamp(1_715_940_983, 0).unwrap().naive_utc()
    }

    #[test]
    fn registry_membership_fixed() {
        let reg = JobRegistry::new();
        assert_eq!(reg.iter().count(), NR_JOBS);
        for name in JobName::ALL {
            assert_eq!(reg.get(name).name, name);
            assert_eq!(reg.status(name), JobStatus::NotCreated);
        }
        reg.check_invariants().unwrap();
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let reg = JobRegistry::new();
        assert!(matches!(reg.lookup("x264"), Err(SchedError::Configuration(_))));
        assert_eq!(reg.lookup("ferret").unwrap().threads, 3);
    }

    #[test]
    fn thread_counts_within_bounds() {
        for name in JobName::ALL {
            assert!((1..=3).contains(&name.threads()), "{} threads", name);
        }
    }

    #[test]
    fn pause_clears_cores() {
        let mut reg = JobRegistry::new();
        reg.mark_started(JobName::Radix, CoreSet::of(&[1]), t0());
        assert!(reg.get(JobName::Radix).consistent());
        reg.mark_paused(JobName::Radix);
        assert!(reg.get(JobName::Radix).cores.is_empty());
        reg.check_invariants().unwrap();
    }

    #[test]
    fn running_with_no_cores_is_violation() {
        let mut reg = JobRegistry::new();
        reg.mark_running(JobName::Vips, CoreSet::EMPTY, 0.0);
        assert!(matches!(reg.check_invariants(), Err(SchedError::InvariantViolation(_))));
    }

    #[test]
    fn occupants_pipe_join_shared_cores() {
        let mut reg = JobRegistry::new();
        reg.mark_started(JobName::Blackscholes, CoreSet::of(&[1, 2]), t0());
        reg.mark_started(JobName::Vips, CoreSet::of(&[2, 3]), t0());
        let occ = reg.occupants();
        assert_eq!(occ[0], "");
        assert_eq!(occ[1], "blackscholes");
        assert_eq!(occ[2], "blackscholes|vips");
        assert_eq!(occ[3], "vips");
    }

    #[test]
    fn exit_time_recorded_once() {
        let mut reg = JobRegistry::new();
        reg.mark_started(JobName::Dedup, CoreSet::of(&[1]), t0());
        let end = t0() + chrono::Duration::seconds(42);
        reg.mark_exited(JobName::Dedup, end);
        reg.mark_exited(JobName::Dedup, end + chrono::Duration::seconds(5));
        assert_eq!(reg.get(JobName::Dedup).runtime_secs(), Some(42.0));
    }
}
