// COLOCATE v0.4.2 -- ADAPTIVE CO-LOCATION SCHEDULER
// KEEPS A LATENCY-CRITICAL CACHE SERVICE WITHIN ITS SLO WHILE SEVEN BATCH
// JOBS SHARE THE REMAINING CORES OF A 4-CORE HOST
//
// SCHEDULING DECISIONS: colocate::control (ONE TICK PER SAMPLING WINDOW)
// THIS BINARY HANDLES: CONFIGURATION, LOGGING, SHUTDOWN, REPORTING

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};

use colocate::load::DemandModel;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const DEFAULT_COMMAND: &str = "./run -a run -S {suite} -p {job} -i native -n {threads}";

#[derive(Parser)]
#[command(name = "colocate")]
#[command(about = "COLOCATE -- ADAPTIVE CO-LOCATION SCHEDULER")]
struct Cli {
    // DEBUG-LEVEL LOGGING (RUST_LOG OVERRIDES)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule the batch jobs next to a live cache service
    Run {
        // PID OF THE CACHE SERVICE (PINNED + SAMPLED)
        #[arg(long, env = "COLOCATE_SERVICE_PID")]
        service_pid: Option<i32>,

        // SAMPLING WINDOW IN MILLISECONDS
        #[arg(long, default_value_t = 1000)]
        window_ms: u64,

        // DEMAND MODEL: net (PACKET RATE) OR cpu (SERVICE CPU%)
        #[arg(long, default_value = "net")]
        model: DemandModel,

        // EVENT LOG, UTILIZATION CSV AND JOB LOGS LAND HERE
        #[arg(long, default_value = "results")]
        out_dir: PathBuf,

        // JOB COMMAND TEMPLATE. PLACEHOLDERS: {job} {suite} {threads}
        #[arg(long, env = "COLOCATE_JOB_COMMAND", default_value = DEFAULT_COMMAND)]
        job_command: String,

        // WORKING DIRECTORY FOR JOB COMMANDS
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        // CGROUP V2 DIRECTORY FOR PER-JOB cpuset + cpu.max (QUOTA ENFORCEMENT)
        #[arg(long)]
        cgroup_root: Option<PathBuf>,
    },

    /// Run the controller against the simulated backend
    Simulate {
        // PREDICTED QPS PER TICK. THE LAST VALUE REPEATS.
        #[arg(long, value_delimiter = ',', default_value = "10000,26000,31000,22000")]
        demands: Vec<f64>,

        #[arg(long, default_value = "net")]
        model: DemandModel,

        // SAME WORK FOR EVERY JOB IN CORE-TICKS (DEFAULT: PER-JOB ESTIMATES)
        #[arg(long)]
        work: Option<f64>,

        // GIVE UP AFTER THIS MANY TICKS
        #[arg(long, default_value_t = 10_000)]
        max_ticks: u64,

        // WRITE THE SAME RECORDS AS A REAL RUN
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Parse an event log and print a per-job timeline
    Replay {
        log: PathBuf,
    },

    /// Check the host for what a real run needs
    Check {
        // ALSO VERIFY THE DIRECTORY A LIVE RUN WOULD GET AS --cgroup-root
        #[arg(long)]
        cgroup_root: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run {
            service_pid,
            window_ms,
            model,
            out_dir,
            job_command,
            workdir,
            cgroup_root,
        } => {
            ctrlc::set_handler(move || {
                SHUTDOWN.store(true, Ordering::Relaxed);
            })?;
            cli::run::run_live(cli::run::LiveConfig {
                service_pid,
                window_ms,
                model,
                out_dir,
                job_command,
                workdir,
                cgroup_root,
            }, &SHUTDOWN)
        }
        Command::Simulate { demands, model, work, max_ticks, out_dir } => {
            ctrlc::set_handler(move || {
                SHUTDOWN.store(true, Ordering::Relaxed);
            })?;
            cli::simulate::run_simulate(&demands, model, work, max_ticks, out_dir.as_deref(), &SHUTDOWN)
        }
        Command::Replay { log } => cli::replay::run_replay(&log),
        Command::Check { cgroup_root } => cli::check::run_check(cgroup_root.as_deref()),
    }
}
