use std::path::Path;

use anyhow::{Context, Result};

use colocate::event::{read_log, timelines, EventKind, Subject, TIME_FORMAT};

pub fn run_replay(path: &Path) -> Result<()> {
    let events = read_log(path).with_context(|| format!("reading {}", path.display()))?;

    println!("COLOCATE EVENT LOG: {}", path.display());
    println!("  EVENTS:          {}", events.len());
    let bounds = |kind| {
        events
            .iter()
            .find(|e| e.kind == kind && e.subject == Subject::Scheduler)
            .map(|e| e.timestamp.format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| "-".into())
    };
    println!("  SCHEDULER START: {}", bounds(EventKind::Start));
    println!("  SCHEDULER END:   {}", bounds(EventKind::End));
    let service_moves = events
        .iter()
        .filter(|e| e.kind == EventKind::UpdateCores && e.subject == Subject::Memcached)
        .count();
    println!("  SERVICE MOVES:   {}", service_moves);
    println!();

    println!(
        "  {:<14}{:>12}{:>10}{:>14}{:>12}",
        "JOB", "RUNTIME (S)", "PAUSES", "CORE UPDATES", "PAUSED (S)"
    );
    for (job, t) in timelines(&events) {
        let runtime = t
            .runtime_secs()
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<14}{:>12}{:>10}{:>14}{:>12.1}",
            job.as_str(), runtime, t.pauses, t.core_updates, t.paused_secs
        );
    }
    Ok(())
}
