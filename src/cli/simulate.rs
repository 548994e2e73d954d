use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Result};

use colocate::backend::SimBackend;
use colocate::control::Controller;
use colocate::event::{self, EventLog};
use colocate::load::{classify, DemandModel, LoadLevel};
use colocate::metrics::ScriptedMetrics;
use colocate::record::Recorder;

pub fn run_simulate(
    demands: &[f64],
    model: DemandModel,
    work: Option<f64>,
    max_ticks: u64,
    out_dir: Option<&Path>,
    shutdown: &AtomicBool,
) -> Result<()> {
    if demands.is_empty() {
        bail!("--demands needs at least one value");
    }
    if let Some(w) = work {
        if !(w > 0.0) {
            bail!("--work must be positive, got {}", w);
        }
    }

    println!("COLOCATE SIMULATION");
    println!("DEMAND MODEL:    {}", model.label());
    let levels: Vec<&str> = demands.iter().map(|&q| classify(q, LoadLevel::Low).label()).collect();
    println!("DEMAND TRACE:    {} ticks ({})", demands.len(), levels.join(" "));
    println!("TICK LIMIT:      {}", max_ticks);
    println!();

    let mut backend = SimBackend::new(event::now());
    if let Some(w) = work {
        backend = backend.with_uniform_work(w);
    }
    let metrics = ScriptedMetrics::from_demands(model, demands);
    let (log, recorder) = match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            (EventLog::create(&dir.join("events.log"))?, Recorder::create(dir)?)
        }
        None => (EventLog::new(), Recorder::discard()),
    };

    let mut ctl = Controller::new(backend, metrics, model, log, recorder).with_tick_limit(max_ticks);
    let summary = ctl.run(shutdown)?;
    super::print_summary(&summary);

    if !summary.finished && !summary.interrupted {
        bail!("simulation hit the tick limit after {} ticks", summary.ticks);
    }
    Ok(())
}
