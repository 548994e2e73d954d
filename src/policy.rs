// COLOCATE CORE ALLOCATION POLICY
// (LOAD LEVEL, PHASE, MINI JOB) -> CORE SET + QUOTA FOR THE CACHE SERVICE
// AND EVERY ACTIVE JOB. THEN DIFF AGAINST THE REGISTRY AND ACTUATE.
//
// 4 CORES. CORE 0 ALWAYS BELONGS TO THE CACHE SERVICE. CORE 1 IS THE SWING
// CORE: SERVICE AT MEDIUM/HIGH, MINI JOB (OR A PHASE JOB) AT LOW.

use tracing::debug;

use crate::backend::Backend;
use crate::cores::CoreSet;
use crate::error::{SchedError, SchedResult};
use crate::event::{EventLog, Subject};
use crate::job::{JobName, JobRegistry, JobStatus};
use crate::load::LoadLevel;
use crate::phase::Phase;

// SHARE OF CORE 1 HANDED TO BATCH WORK
const LOW_CORE1_SHARE: f64    = 1.0;
const MEDIUM_CORE1_SHARE: f64 = 0.25;

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Assignment {
    pub job: JobName,
    pub cores: CoreSet,
    // IN CORES. EQUALS cores.len() UNLESS A PARTIAL CORE IS IN PLAY.
    pub quota: f64,
}

impl Assignment {
    fn full(job: JobName, cores: &[u8]) -> Self {
        let cores = CoreSet::of(cores);
        Self { job, cores, quota: cores.len() as f64 }
    }

    fn capped(job: JobName, cores: &[u8], quota: f64) -> Self {
        Self { job, cores: CoreSet::of(cores), quota }
    }

    fn paused(job: JobName) -> Self {
        Self { job, cores: CoreSet::EMPTY, quota: 0.0 }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Allocation {
    pub service: CoreSet,
    pub jobs: Vec<Assignment>,
}

impl Allocation {
    pub fn get(&self, job: JobName) -> Option<&Assignment> {
        self.jobs.iter().find(|a| a.job == job)
    }

    // A PHASE JOB CAN EXIT BEFORE ITS PARTNER ENDS THE PHASE
    pub fn without_exited(mut self, registry: &JobRegistry) -> Self {
        self.jobs.retain(|a| registry.status(a.job) != JobStatus::Exited);
        self
    }
}

// PHASE JOBS WHEN A MINI JOB HOLDS CORE 1 (OR CORE 1 IS THE SERVICE'S)
fn phase_jobs_without_core1(phase: Phase) -> Vec<Assignment> {
    use JobName as J;
    match phase {
        Phase::BlackscholesVips => vec![
            Assignment::full(J::Blackscholes, &[2]),
            Assignment::full(J::Vips, &[3]),
        ],
        Phase::BlackscholesCanneal => vec![
            Assignment::full(J::Blackscholes, &[2]),
            Assignment::full(J::Canneal, &[3]),
        ],
        Phase::VipsCanneal => vec![
            Assignment::full(J::Vips, &[3]),
            Assignment::full(J::Canneal, &[2]),
        ],
        Phase::Canneal => vec![Assignment::full(J::Canneal, &[2, 3])],
        Phase::Ferret => vec![Assignment::full(J::Ferret, &[2, 3])],
        Phase::Freqmine => vec![Assignment::full(J::Freqmine, &[2, 3])],
        Phase::Init | Phase::Finish => Vec::new(),
    }
}

// PHASE JOBS ABSORB CORE 1 WHEN NO MINI JOB IS LEFT
fn phase_jobs_with_core1(phase: Phase, core1: f64) -> Vec<Assignment> {
    use JobName as J;
    match phase {
        Phase::BlackscholesVips => vec![
            Assignment::capped(J::Blackscholes, &[1, 2], 1.0 + core1),
            Assignment::full(J::Vips, &[2, 3]),
        ],
        Phase::BlackscholesCanneal => vec![
            Assignment::capped(J::Blackscholes, &[1, 2], 1.0 + core1),
            Assignment::full(J::Canneal, &[3]),
        ],
        Phase::VipsCanneal => vec![
            Assignment::full(J::Vips, &[2, 3]),
            Assignment::capped(J::Canneal, &[1], core1),
        ],
        Phase::Canneal => vec![Assignment::capped(J::Canneal, &[1, 2, 3], 2.0 + core1)],
        Phase::Ferret => vec![Assignment::capped(J::Ferret, &[1, 2, 3], 2.0 + core1)],
        Phase::Freqmine => vec![Assignment::capped(J::Freqmine, &[1, 2, 3], 2.0 + core1)],
        Phase::Init | Phase::Finish => Vec::new(),
    }
}

pub fn allocate(level: LoadLevel, phase: Phase, mini: Option<JobName>) -> Allocation {
    let service = level.service_cores();
    let idle_phase = phase.active_jobs().is_empty();

    let jobs = match level {
        LoadLevel::Low | LoadLevel::Medium => {
            let core1 = if level == LoadLevel::Low { LOW_CORE1_SHARE } else { MEDIUM_CORE1_SHARE };
            match mini {
                None => phase_jobs_with_core1(phase, core1),
                Some(m) if idle_phase => vec![Assignment::capped(m, &[1, 2, 3], 2.0 + core1)],
                Some(m) => {
                    let mut jobs = vec![Assignment::capped(m, &[1], core1)];
                    jobs.extend(phase_jobs_without_core1(phase));
                    jobs
                }
            }
        }
        LoadLevel::High => match mini {
            Some(m) if idle_phase => vec![Assignment::full(m, &[2, 3])],
            Some(m) => {
                let mut jobs = vec![Assignment::paused(m)];
                jobs.extend(phase_jobs_without_core1(phase));
                jobs
            }
            None => phase_jobs_without_core1(phase),
        },
    };

    Allocation { service, jobs }
}

// DIFF ONE ALLOCATION AGAINST THE REGISTRY AND ACTUATE.
// CONVERGED STATE IS A NO-OP: NO BACKEND CALLS, NO EVENTS.
// RETURNS THE NUMBER OF ACTUATIONS ISSUED.
pub fn apply<B: Backend + ?Sized>(
    alloc: &Allocation,
    registry: &mut JobRegistry,
    backend: &mut B,
    log: &mut EventLog,
) -> SchedResult<usize> {
    let mut actions = 0;

    if registry.service_cores() != alloc.service {
        backend.pin_service(alloc.service)?;
        registry.set_service_cores(alloc.service);
        log.update_cores(Subject::Memcached, alloc.service)?;
        actions += 1;
    }

    for a in &alloc.jobs {
        let (status, current, quota) = {
            let job = registry.get(a.job);
            (job.status, job.cores, job.quota)
        };
        match (status, a.cores.is_empty()) {
            (JobStatus::Paused, true) | (JobStatus::NotCreated, true) | (JobStatus::Exited, true) => {}
            (JobStatus::NotCreated, false) | (JobStatus::Exited, false) => {
                return Err(SchedError::InvariantViolation(format!(
                    "cannot assign cores {} to {} job {}",
                    a.cores, status.label(), a.job
                )));
            }
            (JobStatus::Running, true) => {
                backend.pause(a.job)?;
                registry.mark_paused(a.job);
                log.pause(a.job)?;
                actions += 1;
            }
            (JobStatus::Paused, false) => {
                backend.unpause(a.job)?;
                registry.mark_unpaused(a.job, a.cores);
                log.unpause(a.job)?;
                backend.update_cores(a.job, a.cores, a.quota)?;
                registry.mark_running(a.job, a.cores, a.quota);
                log.update_cores(Subject::Job(a.job), a.cores)?;
                actions += 2;
            }
            (JobStatus::Running, false) => {
                if current == a.cores && quota == Some(a.quota) {
                    continue;
                }
                backend.update_cores(a.job, a.cores, a.quota)?;
                registry.mark_running(a.job, a.cores, a.quota);
                log.update_cores(Subject::Job(a.job), a.cores)?;
                actions += 1;
            }
        }
        debug!(job = %a.job, cores = %a.cores, quota = a.quota, "assigned");
    }
    Ok(actions)
}
