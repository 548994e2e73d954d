pub mod check;
pub mod replay;
pub mod run;
pub mod simulate;

use colocate::control::RunSummary;

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("COLOCATE SUMMARY");
    println!("  TICKS:           {}", summary.ticks);
    println!("  EVENTS:          {}", summary.events);
    println!(
        "  OUTCOME:         {}",
        if summary.finished {
            "ALL JOBS FINISHED"
        } else if summary.interrupted {
            "INTERRUPTED"
        } else {
            "STOPPED EARLY"
        }
    );
    let phases: Vec<&str> = summary.phases.iter().map(|p| p.label()).collect();
    println!("  PHASES:          {}", phases.join(" -> "));
    println!();
    println!("  {:<14}{:>12}", "JOB", "RUNTIME (S)");
    for (job, runtime) in &summary.runtimes {
        match runtime {
            Some(secs) => println!("  {:<14}{:>12.1}", job.as_str(), secs),
            None => println!("  {:<14}{:>12}", job.as_str(), "-"),
        }
    }
}
