// RUN RECORDS
// utilization.csv  ONE ROW PER TICK
// jobs.csv         name,start,end PER HARVESTED JOB
// logs/<job>.log   CAPTURED JOB OUTPUT

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::cores::NR_CORES;
use crate::error::SchedResult;
use crate::event::TIME_FORMAT;
use crate::job::JobName;

pub const UTILIZATION_HEADER: &str =
    "time,cpu0,cpu1,cpu2,cpu3,mcpu,mem,qps,jobs0,jobs1,jobs2,jobs3";

#[derive(Clone, Debug, PartialEq)]
pub struct UtilizationRow {
    pub time: NaiveDateTime,
    pub per_core_cpu: [f64; NR_CORES],
    pub service_cpu_percent: f64,
    pub memory_percent: f64,
    pub predicted_qps: f64,
    pub occupants: [String; NR_CORES],
}

impl UtilizationRow {
    pub fn to_csv(&self) -> String {
        let mut fields = vec![self.time.format(TIME_FORMAT).to_string()];
        fields.extend(self.per_core_cpu.iter().map(|v| format!("{:.2}", v)));
        fields.push(format!("{:.2}", self.service_cpu_percent));
        fields.push(format!("{:.2}", self.memory_percent));
        fields.push(format!("{:.2}", self.predicted_qps));
        fields.extend(self.occupants.iter().cloned());
        fields.join(",")
    }
}

pub struct Recorder {
    dir: Option<PathBuf>,
    utilization: Option<BufWriter<File>>,
    rows: u64,
}

impl Recorder {
    // NOTHING TOUCHES DISK
    pub fn discard() -> Self {
        Self {
            dir: None,
            utilization: None,
            rows: 0,
        }
    }

    pub fn create(dir: &Path) -> SchedResult<Self> {
        fs::create_dir_all(dir.join("logs"))?;
        let path = dir.join("utilization.csv");
        let fresh = !path.exists();
        let mut utilization = BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?);
        if fresh {
            writeln!(utilization, "{}", UTILIZATION_HEADER)?;
        }
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            utilization: Some(utilization),
            rows: 0,
        })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn utilization(&mut self, row: &UtilizationRow) -> SchedResult<()> {
        if let Some(w) = self.utilization.as_mut() {
            writeln!(w, "{}", row.to_csv())?;
        }
        self.rows += 1;
        Ok(())
    }

    pub fn job_summary(
        &mut self,
        job: JobName,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        logs: &[u8],
    ) -> SchedResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::write(dir.join("logs").join(format!("{}.log", job)), logs)?;
        let fmt = |t: Option<NaiveDateTime>| t.map(|t| t.format(TIME_FORMAT).to_string()).unwrap_or_default();
        let mut jobs = OpenOptions::new().create(true).append(true).open(dir.join("jobs.csv"))?;
        writeln!(jobs, "{},{},{}", job, fmt(start), fmt(end))?;
        Ok(())
    }

    pub fn flush(&mut self) -> SchedResult<()> {
        if let Some(w) = self.utilization.as_mut() {
            w.flush()?;
        }
        Ok(())
    }
}
