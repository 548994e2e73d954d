// SIMULATED BACKEND
// LOGICAL CLOCK, ONE STEP PER refresh(). RUNNING JOBS BURN min(quota, threads)
// CORE-TICKS OF WORK PER STEP AND EXIT WHEN THEIR BUDGET IS SPENT.
// EVERY ACTUATION IS RECORDED FOR INSPECTION.

use chrono::{Duration, NaiveDateTime};

use super::{Backend, Harvest};
use crate::cores::CoreSet;
use crate::error::{SchedError, SchedResult};
use crate::job::{JobName, JobStatus, NR_JOBS};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Create(JobName, u32),
    Start(JobName),
    Pause(JobName),
    Unpause(JobName),
    UpdateCores(JobName, CoreSet, f64),
    PinService(CoreSet),
    Harvest(JobName),
}

// CORE-TICKS OF WORK, ROUGHLY PROPORTIONAL TO NATIVE-INPUT RUNTIMES
fn default_work(job: JobName) -> f64 {
    match job {
        JobName::Radix => 20.0,
        JobName::Dedup => 16.0,
        JobName::Blackscholes => 90.0,
        JobName::Vips => 100.0,
        JobName::Canneal => 150.0,
        JobName::Ferret => 180.0,
        JobName::Freqmine => 160.0,
    }
}

#[derive(Clone, Debug)]
struct SimJob {
    created: bool,
    threads: u32,
    status: JobStatus,
    quota: f64,
    work: f64,
    done: f64,
    started_at: Option<NaiveDateTime>,
    ended_at: Option<NaiveDateTime>,
}

pub struct SimBackend {
    jobs: Vec<SimJob>,
    clock: NaiveDateTime,
    step: Duration,
    service: CoreSet,
    fail_next: Option<JobName>,
    calls: Vec<Call>,
}

impl SimBackend {
    pub fn new(epoch: NaiveDateTime) -> Self {
        Self {
            jobs: JobName::ALL
                .iter()
                .map(|&j| SimJob {
                    created: false,
                    threads: 0,
                    status: JobStatus::NotCreated,
                    quota: 0.0,
                    work: default_work(j),
                    done: 0.0,
                    started_at: None,
                    ended_at: None,
                })
                .collect(),
            clock: epoch,
            step: Duration::seconds(1),
            service: CoreSet::EMPTY,
            fail_next: None,
            calls: Vec::new(),
        }
    }

    pub fn with_work(mut self, job: JobName, work: f64) -> Self {
        self.jobs[job as usize].work = work;
        self
    }

    // EVERY JOB NEEDS THE SAME WORK. TESTS DRIVE EXITS WITH finish().
    pub fn with_uniform_work(mut self, work: f64) -> Self {
        for j in &mut self.jobs {
            j.work = work;
        }
        self
    }

    // FORCE A RUNNING OR PAUSED JOB TO EXIT AT THE CURRENT CLOCK
    pub fn finish(&mut self, job: JobName) {
        let clock = self.clock;
        let j = &mut self.jobs[job as usize];
        if matches!(j.status, JobStatus::Running | JobStatus::Paused) {
            j.status = JobStatus::Exited;
            j.ended_at = Some(clock);
        }
    }

    // THE NEXT ACTUATION ON THIS JOB FAILS ONCE
    pub fn fail_next(&mut self, job: JobName) {
        self.fail_next = Some(job);
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    pub fn service(&self) -> CoreSet {
        self.service
    }

    fn job(&mut self, job: JobName, op: &str) -> SchedResult<&mut SimJob> {
        if self.fail_next == Some(job) {
            self.fail_next = None;
            return Err(SchedError::backend(job.as_str(), format!("injected {} failure", op)));
        }
        let j = &mut self.jobs[job as usize];
        if !j.created {
            return Err(SchedError::backend(job.as_str(), format!("{} before create", op)));
        }
        Ok(j)
    }
}

impl Backend for SimBackend {
    fn create(&mut self, job: JobName, threads: u32) -> SchedResult<()> {
        let j = &mut self.jobs[job as usize];
        if j.created {
            return Err(SchedError::backend(job.as_str(), "already created"));
        }
        j.created = true;
        j.threads = threads;
        self.calls.push(Call::Create(job, threads));
        Ok(())
    }

    fn start(&mut self, job: JobName) -> SchedResult<()> {
        let clock = self.clock;
        let j = self.job(job, "start")?;
        if j.status != JobStatus::NotCreated {
            return Err(SchedError::backend(job.as_str(), format!("cannot start {} job", j.status.label())));
        }
        j.status = JobStatus::Running;
        j.started_at = Some(clock);
        self.calls.push(Call::Start(job));
        Ok(())
    }

    fn pause(&mut self, job: JobName) -> SchedResult<()> {
        let j = self.job(job, "pause")?;
        if j.status != JobStatus::Running {
            return Err(SchedError::backend(job.as_str(), format!("cannot pause {} job", j.status.label())));
        }
        j.status = JobStatus::Paused;
        self.calls.push(Call::Pause(job));
        Ok(())
    }

    fn unpause(&mut self, job: JobName) -> SchedResult<()> {
        let j = self.job(job, "unpause")?;
        if j.status != JobStatus::Paused {
            return Err(SchedError::backend(job.as_str(), format!("cannot unpause {} job", j.status.label())));
        }
        j.status = JobStatus::Running;
        self.calls.push(Call::Unpause(job));
        Ok(())
    }

    fn update_cores(&mut self, job: JobName, cores: CoreSet, quota: f64) -> SchedResult<()> {
        let j = self.job(job, "update_cores")?;
        if j.status == JobStatus::Exited {
            return Err(SchedError::backend(job.as_str(), "cannot update cores of exited job"));
        }
        if cores.is_empty() {
            return Err(SchedError::backend(job.as_str(), "empty cpuset"));
        }
        j.quota = quota;
        self.calls.push(Call::UpdateCores(job, cores, quota));
        Ok(())
    }

    fn status(&mut self, job: JobName) -> SchedResult<JobStatus> {
        Ok(self.jobs[job as usize].status)
    }

    fn harvest(&mut self, job: JobName) -> SchedResult<Harvest> {
        let j = &self.jobs[job as usize];
        if j.status != JobStatus::Exited {
            return Err(SchedError::backend(job.as_str(), "harvest before exit"));
        }
        let logs = format!("[sim] {} threads={} work={:.1}\n", job, j.threads, j.done.max(j.work));
        let harvest = Harvest {
            logs: logs.into_bytes(),
            started_at: j.started_at,
            ended_at: j.ended_at,
        };
        self.calls.push(Call::Harvest(job));
        Ok(harvest)
    }

    fn pin_service(&mut self, cores: CoreSet) -> SchedResult<()> {
        self.service = cores;
        self.calls.push(Call::PinService(cores));
        Ok(())
    }

    fn refresh(&mut self) -> SchedResult<()> {
        self.clock += self.step;
        let clock = self.clock;
        for j in self.jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            j.done += j.quota.min(j.threads as f64);
            if j.done >= j.work {
                j.status = JobStatus::Exited;
                j.ended_at = Some(clock);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SimBackend {
        let epoch = chrono::DateTime::from_timestamp(0, 0).unwrap().naive_utc();
        let mut b = SimBackend::new(epoch);
        for job in JobName::ALL {
            b.create(job, job.threads()).unwrap();
        }
        b
    }

    #[test]
    fn pause_requires_running() {
        let mut b = backend();
        assert!(b.pause(JobName::Radix).is_err());
        b.update_cores(JobName::Radix, CoreSet::of(&[1]), 1.0).unwrap();
        b.start(JobName::Radix).unwrap();
        b.pause(JobName::Radix).unwrap();
        assert!(b.pause(JobName::Radix).is_err());
        b.unpause(JobName::Radix).unwrap();
    }

    #[test]
    fn work_burns_at_quota() {
        let mut b = backend().with_work(JobName::Dedup, 2.0);
        b.update_cores(JobName::Dedup, CoreSet::of(&[1]), 0.5).unwrap();
        b.start(JobName::Dedup).unwrap();
        for _ in 0..3 {
            b.refresh().unwrap();
        }
        assert_eq!(b.status(JobName::Dedup).unwrap(), JobStatus::Running);
        b.refresh().unwrap();
        assert_eq!(b.status(JobName::Dedup).unwrap(), JobStatus::Exited);
        assert!(b.harvest(JobName::Dedup).is_ok());
    }

    #[test]
    fn paused_job_makes_no_progress() {
        let mut b = backend().with_work(JobName::Radix, 1.0);
        b.update_cores(JobName::Radix, CoreSet::of(&[1]), 1.0).unwrap();
        b.start(JobName::Radix).unwrap();
        b.pause(JobName::Radix).unwrap();
        b.refresh().unwrap();
        assert_eq!(b.status(JobName::Radix).unwrap(), JobStatus::Paused);
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut b = backend();
        b.fail_next(JobName::Vips);
        assert!(b.update_cores(JobName::Vips, CoreSet::of(&[3]), 1.0).is_err());
        assert!(b.update_cores(JobName::Vips, CoreSet::of(&[3]), 1.0).is_ok());
    }

    #[test]
    fn every_job_has_work() {
        let b = backend();
        assert_eq!(b.jobs.len(), NR_JOBS);
        assert!(b.jobs.iter().all(|j| j.work > 0.0));
    }
}
