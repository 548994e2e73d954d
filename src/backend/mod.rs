// COLOCATE JOB ACTUATION
// CAPABILITY INTERFACE OVER WHATEVER RUNS THE BATCH JOBS.
// PAUSE, UNPAUSE AND UPDATE_CORES STAY THREE SEPARATE CALLS: THE EVENT LOG
// RECORDS EACH ONE AS ITS OWN LINE.

mod process;
mod sim;

pub use process::{missing_controllers, ProcessBackend, ProcessConfig};
pub use sim::{Call, SimBackend};

use chrono::NaiveDateTime;

use crate::cores::CoreSet;
use crate::error::SchedResult;
use crate::job::{JobName, JobStatus};

#[derive(Clone, Debug, Default)]
pub struct Harvest {
    pub logs: Vec<u8>,
    pub started_at: Option<NaiveDateTime>,
    pub ended_at: Option<NaiveDateTime>,
}

pub trait Backend {
    fn create(&mut self, job: JobName, threads: u32) -> SchedResult<()>;
    fn start(&mut self, job: JobName) -> SchedResult<()>;
    fn pause(&mut self, job: JobName) -> SchedResult<()>;
    fn unpause(&mut self, job: JobName) -> SchedResult<()>;
    // QUOTA IN CORES: 1.0 IS ONE FULL CORE
    fn update_cores(&mut self, job: JobName, cores: CoreSet, quota: f64) -> SchedResult<()>;
    fn status(&mut self, job: JobName) -> SchedResult<JobStatus>;
    fn harvest(&mut self, job: JobName) -> SchedResult<Harvest>;

    // CACHE SERVICE AFFINITY
    fn pin_service(&mut self, cores: CoreSet) -> SchedResult<()>;

    // SYNC ANY ASYNCHRONOUSLY GATHERED STATE BEFORE STATUSES ARE POLLED
    fn refresh(&mut self) -> SchedResult<()> {
        Ok(())
    }
}
