// COLOCATE CONTROL LOOP
// ONE TICK PER SAMPLING WINDOW:
//   SAMPLE -> CLASSIFY -> POLL JOBS -> ADVANCE PHASE -> START -> REALLOCATE -> RECORD
//
// ACTUATION THAT FAILS LEAVES THE CONTROLLER DIRTY. THE NEXT TICK RETRIES
// THE PENDING STARTS AND THE FULL ALLOCATION, SO A TRANSIENT BACKEND ERROR
// NEVER LOSES A PHASE TRANSITION.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::cores::CoreSet;
use crate::error::{SchedError, SchedResult};
use crate::event::{self, EventLog, Subject};
use crate::job::{JobName, JobRegistry, JobStatus};
use crate::load::{self, DemandModel, LoadLevel};
use crate::metrics::{MetricsSource, Sample};
use crate::phase::{Phase, Strategy};
use crate::policy;
use crate::record::{Recorder, UtilizationRow};

// SERVICE KEEPS TWO CORES ONCE THE BATCH WORK IS GONE
const RESTORED_SERVICE_CORES: [u8; 2] = [0, 1];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TickOutcome {
    Running,
    Finished,
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub ticks: u64,
    pub finished: bool,
    pub interrupted: bool,
    pub phases: Vec<Phase>,
    pub events: usize,
    pub runtimes: Vec<(JobName, Option<f64>)>,
}

pub struct Controller<B: Backend, M: MetricsSource> {
    backend: B,
    metrics: M,
    model: DemandModel,
    registry: JobRegistry,
    strategy: Strategy,
    level: LoadLevel,
    last_qps: f64,
    log: EventLog,
    recorder: Recorder,
    // STARTS RETURNED BY THE STRATEGY BUT NOT YET ISSUED
    pending: Vec<JobName>,
    dirty: bool,
    finished: bool,
    ticks: u64,
    tick_limit: Option<u64>,
}

impl<B: Backend, M: MetricsSource> Controller<B, M> {
    pub fn new(backend: B, metrics: M, model: DemandModel, log: EventLog, recorder: Recorder) -> Self {
        Self {
            backend,
            metrics,
            model,
            registry: JobRegistry::new(),
            strategy: Strategy::new(),
            level: LoadLevel::Low,
            last_qps: 0.0,
            log,
            recorder,
            pending: Vec::new(),
            dirty: false,
            finished: false,
            ticks: 0,
            tick_limit: None,
        }
    }

    // STOP AFTER N TICKS EVEN IF JOBS REMAIN (SIMULATION ONLY)
    pub fn with_tick_limit(mut self, ticks: u64) -> Self {
        self.tick_limit = Some(ticks);
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn level(&self) -> LoadLevel {
        self.level
    }

    pub fn last_qps(&self) -> f64 {
        self.last_qps
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // --- STARTUP ---

    pub fn startup(&mut self) -> SchedResult<()> {
        for name in JobName::ALL {
            self.backend.create(name, name.threads())?;
        }
        self.log.scheduler_start()?;
        self.pending = self.strategy.get_jobs_to_run(&self.registry);
        self.dirty = true;
        info!(phase = %self.strategy.phase(), jobs = ?self.pending, "startup");
        self.reconcile()
    }

    // ISSUE PENDING STARTS, THEN BRING EVERY ACTIVE JOB TO THE ALLOCATION
    fn reconcile(&mut self) -> SchedResult<()> {
        if !self.dirty {
            return Ok(());
        }
        while let Some(&job) = self.pending.first() {
            if self.registry.status(job) == JobStatus::NotCreated {
                self.start_job(job)?;
            }
            self.pending.remove(0);
        }
        if let Some(mini) = self.strategy.next_mini_job(&self.registry) {
            if self.registry.status(mini) == JobStatus::NotCreated {
                self.start_job(mini)?;
            }
        }
        let mini = self.strategy.next_mini_job(&self.registry);
        let alloc = policy::allocate(self.level, self.strategy.phase(), mini).without_exited(&self.registry);
        let actions = policy::apply(&alloc, &mut self.registry, &mut self.backend, &mut self.log)?;
        debug!(actions, level = %self.level, phase = %self.strategy.phase(), "reconciled");
        self.dirty = false;
        Ok(())
    }

    fn start_job(&mut self, job: JobName) -> SchedResult<()> {
        let cores = job.initial_cores();
        let threads = job.threads();
        self.backend.update_cores(job, cores, cores.len() as f64)?;
        self.backend.start(job)?;
        self.registry.mark_started(job, cores, event::now());
        self.log.job_start(job, cores, threads)?;
        info!(job = %job, %cores, threads, "job started");
        Ok(())
    }

    // --- TICK ---

    pub fn tick(&mut self) -> SchedResult<TickOutcome> {
        if self.finished {
            return Ok(TickOutcome::Finished);
        }
        self.ticks += 1;

        let sample = match self.metrics.sample() {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("metrics unavailable, holding {}: {}", self.level, e);
                None
            }
        };
        if let Some(s) = &sample {
            match load::assess(self.model, s, self.level) {
                Ok((qps, level)) => {
                    self.last_qps = qps;
                    if level != self.level {
                        info!(from = %self.level, to = %level, qps = qps.round() as i64, "load level change");
                        self.level = level;
                        self.dirty = true;
                    }
                }
                Err(e) => warn!("demand not computable, holding {}: {}", self.level, e),
            }
        }

        self.backend.refresh()?;
        if self.poll_jobs()? {
            let start = self.strategy.get_jobs_to_run(&self.registry);
            self.pending.extend(start);
            self.dirty = true;
        }
        self.registry.check_invariants()?;

        self.reconcile()?;
        self.registry.check_invariants()?;

        self.record_utilization(sample.as_ref())?;
        self.telemetry();

        if self.registry.all_exited() {
            self.finish()?;
            return Ok(TickOutcome::Finished);
        }
        Ok(TickOutcome::Running)
    }

    // TRUE IF ANY JOB FINISHED SINCE THE LAST POLL
    fn poll_jobs(&mut self) -> SchedResult<bool> {
        let mut finished = false;
        for name in JobName::ALL {
            let job = self.registry.get(name);
            if job.acknowledged || job.status == JobStatus::NotCreated {
                continue;
            }
            // ONE UNREADABLE STATUS MUST NOT HIDE THE OTHERS' EXITS
            match self.backend.status(name) {
                Ok(JobStatus::Exited) => {}
                Ok(_) => continue,
                Err(e) if e.is_recoverable() => {
                    warn!(job = %name, "status unavailable: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.registry.mark_exited(name, event::now());
            self.registry.get_mut(name).acknowledged = true;
            self.log.job_end(name)?;
            info!(job = %name, "job finished");
            finished = true;
        }
        Ok(finished)
    }

    fn record_utilization(&mut self, sample: Option<&Sample>) -> SchedResult<()> {
        let (per_core_cpu, service_cpu_percent, memory_percent) = match sample {
            Some(s) => (s.per_core_cpu, s.service_cpu_percent, s.memory_percent),
            None => (Default::default(), f64::NAN, f64::NAN),
        };
        self.recorder.utilization(&UtilizationRow {
            time: event::now(),
            per_core_cpu,
            service_cpu_percent,
            memory_percent,
            predicted_qps: self.last_qps,
            occupants: self.registry.occupants(),
        })
    }

    fn telemetry(&self) {
        let occ = self.registry.occupants();
        info!(
            "tick {:>4}  qps: {:>7.0}  load: {:<6}  phase: {:<20}  cores: [{}] [{}] [{}] [{}]",
            self.ticks,
            self.last_qps,
            self.level.label(),
            self.strategy.phase().label(),
            occ[0], occ[1], occ[2], occ[3],
        );
    }

    // --- SHUTDOWN ---

    fn finish(&mut self) -> SchedResult<()> {
        for name in JobName::ALL {
            self.harvest(name)?;
        }
        let restored = CoreSet::of(&RESTORED_SERVICE_CORES);
        if self.registry.service_cores() != restored {
            self.backend.pin_service(restored)?;
            self.registry.set_service_cores(restored);
            self.log.update_cores(Subject::Memcached, restored)?;
        }
        self.log.scheduler_end()?;
        self.recorder.flush()?;
        self.finished = true;
        info!(ticks = self.ticks, "all jobs finished");
        Ok(())
    }

    fn harvest(&mut self, name: JobName) -> SchedResult<()> {
        let harvest = self.backend.harvest(name)?;
        let job = self.registry.get(name);
        let start = harvest.started_at.or(job.started_at);
        let end = harvest.ended_at.or(job.ended_at);
        self.recorder.job_summary(name, start, end, &harvest.logs)
    }

    pub fn interrupt(&mut self) -> SchedResult<()> {
        self.stop_early("interrupted")
    }

    // NO MORE ACTUATION. HARVEST WHAT ALREADY EXITED, CLOSE THE LOG.
    fn stop_early(&mut self, reason: &str) -> SchedResult<()> {
        warn!("{}, {} jobs still live", reason, self.registry.iter().filter(|j| j.status != JobStatus::Exited).count());
        self.log.custom(Subject::Scheduler, reason)?;
        for name in JobName::ALL {
            if self.registry.status(name) != JobStatus::Exited {
                continue;
            }
            if let Err(e) = self.harvest(name) {
                warn!(job = %name, "harvest skipped: {}", e);
            }
        }
        self.log.scheduler_end()?;
        self.recorder.flush()
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> SchedResult<RunSummary> {
        if let Err(e) = self.startup() {
            // BEFORE THE FIRST TRANSITION THERE IS NOTHING TO RETRY
            if !e.is_recoverable() || self.strategy.phase() == Phase::Init {
                return Err(self.abort(e));
            }
            warn!("startup incomplete, retrying next tick: {}", e);
        }

        let mut interrupted = false;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                self.interrupt()?;
                interrupted = true;
                break;
            }
            if self.tick_limit.is_some_and(|limit| self.ticks >= limit) {
                warn!(ticks = self.ticks, "tick limit reached before all jobs finished");
                self.stop_early("tick limit")?;
                break;
            }
            match self.tick() {
                Ok(TickOutcome::Finished) => break,
                Ok(TickOutcome::Running) => {}
                Err(e) if e.is_recoverable() => {
                    warn!("tick {} aborted: {}", self.ticks, e);
                    self.dirty = true;
                }
                Err(e) => return Err(self.abort(e)),
            }
        }

        Ok(self.summary(interrupted))
    }

    fn abort(&mut self, e: SchedError) -> SchedError {
        error!("fatal: {}", e);
        if let Err(flush) = self.log.flush() {
            error!("event log flush failed: {}", flush);
        }
        if let Err(flush) = self.recorder.flush() {
            error!("utilization flush failed: {}", flush);
        }
        e
    }

    pub fn summary(&self, interrupted: bool) -> RunSummary {
        RunSummary {
            ticks: self.ticks,
            finished: self.finished,
            interrupted,
            phases: self.strategy.history().to_vec(),
            events: self.log.len(),
            runtimes: self.registry.iter().map(|j| (j.name, j.runtime_secs())).collect(),
        }
    }
}
