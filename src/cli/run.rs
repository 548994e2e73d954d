use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{bail, Result};

use colocate::backend::{ProcessBackend, ProcessConfig};
use colocate::control::Controller;
use colocate::cores::NR_CORES;
use colocate::event::EventLog;
use colocate::load::DemandModel;
use colocate::metrics::ProcMetrics;
use colocate::record::Recorder;

pub struct LiveConfig {
    pub service_pid: Option<i32>,
    pub window_ms: u64,
    pub model: DemandModel,
    pub out_dir: PathBuf,
    pub job_command: String,
    pub workdir: PathBuf,
    pub cgroup_root: Option<PathBuf>,
}

pub fn run_live(cfg: LiveConfig, shutdown: &AtomicBool) -> Result<()> {
    if cfg.window_ms == 0 {
        bail!("--window-ms must be positive");
    }
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online < NR_CORES as i64 {
        bail!("need {} online cpus, found {}", NR_CORES, online);
    }

    println!("COLOCATE v{}", env!("CARGO_PKG_VERSION"));
    println!("CPUS:            {} (managing 0-{})", online, NR_CORES - 1);
    println!("SERVICE PID:     {}", cfg.service_pid.map(|p| p.to_string()).unwrap_or_else(|| "none".into()));
    println!("DEMAND MODEL:    {}", cfg.model.label());
    println!("WINDOW:          {} ms", cfg.window_ms);
    println!("QUOTA:           {}", match &cfg.cgroup_root {
        Some(root) => format!("cgroup ({})", root.display()),
        None => "affinity only".into(),
    });
    println!("OUTPUT:          {}", cfg.out_dir.display());
    println!();

    std::fs::create_dir_all(&cfg.out_dir)?;
    let backend = ProcessBackend::new(ProcessConfig {
        command: cfg.job_command,
        workdir: cfg.workdir,
        log_dir: cfg.out_dir.join("job-output"),
        cgroup_root: cfg.cgroup_root,
        service_pid: cfg.service_pid,
    })?;
    let metrics = ProcMetrics::new(cfg.model, cfg.service_pid, Duration::from_millis(cfg.window_ms))?;
    let log = EventLog::create(&cfg.out_dir.join("events.log"))?;
    let recorder = Recorder::create(&cfg.out_dir)?;

    let mut ctl = Controller::new(backend, metrics, cfg.model, log, recorder);
    println!("COLOCATE IS ACTIVE (CTRL+C TO EXIT)");
    let summary = ctl.run(shutdown)?;
    println!("COLOCATE IS SHUTTING DOWN");

    super::print_summary(&summary);
    println!();
    println!("COLOCATE OUT.");
    Ok(())
}
