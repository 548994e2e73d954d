// COLOCATE END-TO-END SIMULATION
// FULL CONTROLLER RUNS AGAINST THE SIMULATED BACKEND AND A SCRIPTED
// DEMAND TRACE. CHECKS THE PER-TICK INVARIANTS AND THE ON-DISK RECORDS.

use std::sync::atomic::AtomicBool;

use colocate::backend::SimBackend;
use colocate::control::{Controller, TickOutcome};
use colocate::cores::CoreSet;
use colocate::event::{read_log, timelines, EventKind, EventLog, Subject};
use colocate::job::{JobName, JobStatus};
use colocate::load::{DemandModel, LoadLevel};
use colocate::metrics::ScriptedMetrics;
use colocate::phase::Phase;
use colocate::record::{Recorder, UTILIZATION_HEADER};

fn epoch() -> chrono::NaiveDateTime {
    chrono::DateTime::from_timestamp(1_715_940_983, 0).unwrap().naive_utc()
}

// DEMAND SWINGS THROUGH EVERY LEVEL EVERY FEW TICKS
fn swinging_trace(ticks: usize) -> Vec<f64> {
    let cycle = [10_000.0, 26_000.0, 31_000.0, 31_000.0, 22_000.0, 28_000.0];
    (0..ticks).map(|i| cycle[i % cycle.len()]).collect()
}

fn sim(demands: &[f64], model: DemandModel) -> Controller<SimBackend, ScriptedMetrics> {
    Controller::new(
        SimBackend::new(epoch()),
        ScriptedMetrics::from_demands(model, demands),
        model,
        EventLog::new(),
        Recorder::discard(),
    )
}

// === PER-TICK INVARIANTS ===

#[test]
fn invariants_hold_every_tick_until_finish() {
    let mut ctl = sim(&swinging_trace(2_000), DemandModel::Net);
    ctl.startup().unwrap();
    let mut ticks = 0;
    loop {
        let outcome = ctl.tick().unwrap();
        ticks += 1;
        ctl.registry().check_invariants().unwrap();

        let service = ctl.registry().service_cores();
        assert!(service.contains(0));
        for job in ctl.registry().iter() {
            if job.status != JobStatus::Running {
                assert!(job.cores.is_empty(), "{} {} holds {}", job.name, job.status.label(), job.cores);
                continue;
            }
            assert!(!job.cores.contains(0), "{} on core 0", job.name);
            if ctl.level() == LoadLevel::High {
                assert!(!job.cores.contains(1), "{} on core 1 at HIGH", job.name);
            }
        }

        if outcome == TickOutcome::Finished {
            break;
        }
        assert!(ticks < 5_000, "no progress after {} ticks", ticks);
    }
    assert!(ctl.registry().all_exited());
    assert_eq!(ctl.strategy().phase(), Phase::Finish);
    assert_eq!(ctl.registry().service_cores(), CoreSet::of(&[0, 1]));
}

#[test]
fn both_demand_models_finish() {
    for model in [DemandModel::Net, DemandModel::Cpu] {
        let mut ctl = sim(&swinging_trace(500), model);
        let summary = ctl.run(&AtomicBool::new(false)).unwrap();
        assert!(summary.finished, "{} model did not finish", model.label());
        assert!(summary.runtimes.iter().all(|(_, r)| r.is_some()));
    }
}

#[test]
fn phase_history_strictly_increasing() {
    let mut ctl = sim(&swinging_trace(500), DemandModel::Net);
    let summary = ctl.run(&AtomicBool::new(false)).unwrap();
    for w in summary.phases.windows(2) {
        assert!(w[0].rank() < w[1].rank(), "{} then {}", w[0], w[1]);
    }
}

#[test]
fn every_job_starts_and_ends_exactly_once() {
    let mut ctl = sim(&[10_000.0], DemandModel::Net);
    ctl.run(&AtomicBool::new(false)).unwrap();
    for job in JobName::ALL {
        let count = |kind| {
            ctl.log()
                .events()
                .iter()
                .filter(|e| e.kind == kind && e.subject == Subject::Job(job))
                .count()
        };
        assert_eq!(count(EventKind::Start), 1, "{} starts", job);
        assert_eq!(count(EventKind::End), 1, "{} ends", job);
    }
}

#[test]
fn dedup_starts_after_radix_ends() {
    let mut ctl = sim(&[10_000.0], DemandModel::Net);
    ctl.run(&AtomicBool::new(false)).unwrap();
    let events = ctl.log().events();
    let radix_end = events
        .iter()
        .position(|e| e.kind == EventKind::End && e.subject == Subject::Job(JobName::Radix))
        .unwrap();
    let dedup_start = events
        .iter()
        .position(|e| e.kind == EventKind::Start && e.subject == Subject::Job(JobName::Dedup))
        .unwrap();
    assert!(radix_end < dedup_start);
}

#[test]
fn steady_load_issues_no_extra_actuation() {
    let mut ctl = sim(&[10_000.0], DemandModel::Net);
    ctl.startup().unwrap();
    let after_startup = ctl.log().len();
    ctl.tick().unwrap();
    ctl.tick().unwrap();
    assert_eq!(ctl.log().len(), after_startup);
}

// === RECORDS ===

#[test]
fn records_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("events.log");
    let mut ctl = Controller::new(
        SimBackend::new(epoch()),
        ScriptedMetrics::from_demands(DemandModel::Net, &swinging_trace(300)),
        DemandModel::Net,
        EventLog::create(&log_path).unwrap(),
        Recorder::create(dir.path()).unwrap(),
    );
    let summary = ctl.run(&AtomicBool::new(false)).unwrap();
    assert!(summary.finished);

    let parsed = read_log(&log_path).unwrap();
    assert_eq!(parsed.as_slice(), ctl.log().events());
    assert_eq!(parsed.first().map(|e| (e.kind, e.subject)), Some((EventKind::Start, Subject::Scheduler)));
    assert_eq!(parsed.last().map(|e| (e.kind, e.subject)), Some((EventKind::End, Subject::Scheduler)));

    for (job, t) in timelines(&parsed) {
        assert!(t.start.is_some() && t.end.is_some(), "{} timeline incomplete", job);
    }

    let utilization = std::fs::read_to_string(dir.path().join("utilization.csv")).unwrap();
    let mut lines = utilization.lines();
    assert_eq!(lines.next(), Some(UTILIZATION_HEADER));
    assert_eq!(lines.count() as u64, summary.ticks);
    assert_eq!(ctl.recorder().rows(), ctl.ticks());

    let jobs = std::fs::read_to_string(dir.path().join("jobs.csv")).unwrap();
    assert_eq!(jobs.lines().count(), JobName::ALL.len());
    for job in JobName::ALL {
        assert!(dir.path().join("logs").join(format!("{}.log", job)).exists());
    }
}

#[test]
fn interrupted_run_leaves_parseable_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("events.log");
    let mut ctl = Controller::new(
        SimBackend::new(epoch()),
        ScriptedMetrics::from_demands(DemandModel::Net, &[10_000.0]),
        DemandModel::Net,
        EventLog::create(&log_path).unwrap(),
        Recorder::discard(),
    );
    let summary = ctl.run(&AtomicBool::new(true)).unwrap();
    assert!(summary.interrupted);

    let parsed = read_log(&log_path).unwrap();
    let n = parsed.len();
    assert_eq!(parsed[n - 2].kind, EventKind::Custom);
    assert_eq!((parsed[n - 1].kind, parsed[n - 1].subject), (EventKind::End, Subject::Scheduler));
}
