// PROCESS BACKEND
// EACH JOB IS A SHELL COMMAND IN ITS OWN PROCESS GROUP.
//   PAUSE/UNPAUSE: SIGSTOP/SIGCONT TO THE GROUP
//   CORES:         sched_setaffinity ON EVERY THREAD IN THE GROUP
//   QUOTA:         cgroup v2 cpu.max, ONLY WHEN A CGROUP ROOT IS CONFIGURED

use std::collections::HashMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use super::{Backend, Harvest};
use crate::cores::CoreSet;
use crate::error::{SchedError, SchedResult};
use crate::job::{JobName, JobStatus};

const CPU_PERIOD_US: u64 = 100_000;
const CGROUP_CONTROLLERS: [&str; 2] = ["cpuset", "cpu"];

#[derive(Clone, Debug)]
pub struct ProcessConfig {
    // PLACEHOLDERS: {job} {suite} {threads}
    pub command: String,
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
    pub cgroup_root: Option<PathBuf>,
    pub service_pid: Option<i32>,
}

impl ProcessConfig {
    pub fn render(&self, job: JobName, threads: u32) -> String {
        self.command
            .replace("{job}", job.as_str())
            .replace("{suite}", job.suite())
            .replace("{threads}", &threads.to_string())
    }
}

struct Proc {
    command: String,
    child: Option<Child>,
    stopped: bool,
    exited: bool,
    pending: Option<(CoreSet, f64)>,
    log_path: PathBuf,
    started_at: Option<NaiveDateTime>,
    ended_at: Option<NaiveDateTime>,
}

pub struct ProcessBackend {
    config: ProcessConfig,
    procs: HashMap<JobName, Proc>,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig) -> SchedResult<Self> {
        fs::create_dir_all(&config.log_dir)?;
        if let Some(root) = &config.cgroup_root {
            enable_controllers(root)?;
        }
        Ok(Self {
            config,
            procs: HashMap::new(),
        })
    }

    fn proc_mut(&mut self, job: JobName) -> SchedResult<&mut Proc> {
        self.procs
            .get_mut(&job)
            .ok_or_else(|| SchedError::backend(job.as_str(), "not created"))
    }

    fn cgroup_dir(&self, job: JobName) -> Option<PathBuf> {
        self.config.cgroup_root.as_ref().map(|r| r.join(job.as_str()))
    }

    fn apply_cores(&self, job: JobName, pgid: i32, cores: CoreSet, quota: f64) -> SchedResult<()> {
        if let Some(dir) = self.cgroup_dir(job) {
            let max = (quota * CPU_PERIOD_US as f64).round() as u64;
            write_knob(&dir.join("cpuset.cpus"), &cores.to_cpulist())
                .and_then(|_| write_knob(&dir.join("cpu.max"), &format!("{} {}", max, CPU_PERIOD_US)))
                .map_err(|e| SchedError::backend(job.as_str(), format!("cgroup update: {}", e)))?;
            return Ok(());
        }
        debug!(job = %job, quota, "no cgroup root, quota not enforced");
        for tid in group_tids(pgid) {
            // THREADS CAN EXIT BETWEEN LISTING AND PINNING
            if let Err(e) = set_affinity(tid, cores) {
                if e.raw_os_error() != Some(libc::ESRCH) {
                    return Err(SchedError::backend(job.as_str(), format!("sched_setaffinity({}): {}", tid, e)));
                }
            }
        }
        Ok(())
    }

    // KILL AND REAP A HALF-STARTED GROUP SO THE NEXT start() BEGINS CLEAN
    fn discard(&mut self, job: JobName, pending: Option<(CoreSet, f64)>) {
        let Some(p) = self.procs.get_mut(&job) else { return };
        if let Some(mut child) = p.child.take() {
            unsafe { libc::killpg(child.id() as i32, libc::SIGKILL) };
            if let Err(e) = child.wait() {
                warn!(job = %job, "reap after failed start: {}", e);
            }
        }
        p.started_at = None;
        p.stopped = false;
        p.pending = pending;
    }

    fn signal(&mut self, job: JobName, sig: libc::c_int) -> SchedResult<()> {
        let p = self.proc_mut(job)?;
        let pgid = match &p.child {
            Some(c) if !p.exited => c.id() as i32,
            _ => return Err(SchedError::backend(job.as_str(), "no live process group")),
        };
        if unsafe { libc::killpg(pgid, sig) } != 0 {
            let e = std::io::Error::last_os_error();
            return Err(SchedError::backend(job.as_str(), format!("killpg({}): {}", sig, e)));
        }
        Ok(())
    }
}

impl Backend for ProcessBackend {
    fn create(&mut self, job: JobName, threads: u32) -> SchedResult<()> {
        if self.procs.contains_key(&job) {
            return Err(SchedError::backend(job.as_str(), "already created"));
        }
        if let Some(dir) = self.cgroup_dir(job) {
            fs::create_dir_all(&dir)
                .map_err(|e| SchedError::backend(job.as_str(), format!("mkdir {}: {}", dir.display(), e)))?;
        }
        let command = self.config.render(job, threads);
        debug!(job = %job, %command, "created");
        self.procs.insert(job, Proc {
            command,
            child: None,
            stopped: false,
            exited: false,
            pending: None,
            log_path: self.config.log_dir.join(format!("{}.log", job)),
            started_at: None,
            ended_at: None,
        });
        Ok(())
    }

    fn start(&mut self, job: JobName) -> SchedResult<()> {
        let workdir = self.config.workdir.clone();
        let cgroup = self.cgroup_dir(job);
        let p = self.proc_mut(job)?;
        if p.child.is_some() {
            return Err(SchedError::backend(job.as_str(), "already started"));
        }
        let log = fs::File::create(&p.log_path)?;
        let child = Command::new("sh")
            .arg("-c")
            .arg(&p.command)
            .current_dir(&workdir)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| SchedError::backend(job.as_str(), format!("spawn: {}", e)))?;
        let pgid = child.id() as i32;
        p.child = Some(child);
        p.started_at = Some(chrono::Local::now().naive_local());
        let pending = p.pending.take();

        let placed = match cgroup {
            Some(dir) => write_knob(&dir.join("cgroup.procs"), &pgid.to_string())
                .map_err(|e| SchedError::backend(job.as_str(), format!("cgroup attach: {}", e))),
            None => Ok(()),
        };
        let placed = placed.and_then(|_| match pending {
            Some((cores, quota)) => self.apply_cores(job, pgid, cores, quota),
            None => Ok(()),
        });
        if let Err(e) = placed {
            // A JOB IS EITHER FULLY PLACED OR NOT STARTED AT ALL
            self.discard(job, pending);
            return Err(e);
        }
        Ok(())
    }

    fn pause(&mut self, job: JobName) -> SchedResult<()> {
        if self.proc_mut(job)?.stopped {
            return Err(SchedError::backend(job.as_str(), "already paused"));
        }
        self.signal(job, libc::SIGSTOP)?;
        self.proc_mut(job)?.stopped = true;
        Ok(())
    }

    fn unpause(&mut self, job: JobName) -> SchedResult<()> {
        if !self.proc_mut(job)?.stopped {
            return Err(SchedError::backend(job.as_str(), "not paused"));
        }
        self.signal(job, libc::SIGCONT)?;
        self.proc_mut(job)?.stopped = false;
        Ok(())
    }

    fn update_cores(&mut self, job: JobName, cores: CoreSet, quota: f64) -> SchedResult<()> {
        if cores.is_empty() {
            return Err(SchedError::backend(job.as_str(), "empty cpuset"));
        }
        let p = self.proc_mut(job)?;
        if p.exited {
            return Err(SchedError::backend(job.as_str(), "process exited"));
        }
        let pgid = match &p.child {
            Some(c) => c.id() as i32,
            None => {
                // NOT STARTED YET: APPLIED RIGHT AFTER SPAWN
                p.pending = Some((cores, quota));
                return Ok(());
            }
        };
        self.apply_cores(job, pgid, cores, quota)
    }

    fn status(&mut self, job: JobName) -> SchedResult<JobStatus> {
        let p = self.proc_mut(job)?;
        if p.exited {
            return Ok(JobStatus::Exited);
        }
        let Some(child) = p.child.as_mut() else {
            return Ok(JobStatus::NotCreated);
        };
        match child.try_wait() {
            Ok(Some(code)) => {
                debug!(job = %job, %code, "process exited");
                p.exited = true;
                p.stopped = false;
                p.ended_at = Some(chrono::Local::now().naive_local());
                Ok(JobStatus::Exited)
            }
            Ok(None) if p.stopped => Ok(JobStatus::Paused),
            Ok(None) => Ok(JobStatus::Running),
            Err(e) => Err(SchedError::backend(job.as_str(), format!("wait: {}", e))),
        }
    }

    fn harvest(&mut self, job: JobName) -> SchedResult<Harvest> {
        let cgroup = self.cgroup_dir(job);
        let p = self.proc_mut(job)?;
        if !p.exited {
            return Err(SchedError::backend(job.as_str(), "harvest before exit"));
        }
        let logs = fs::read(&p.log_path).unwrap_or_default();
        let harvest = Harvest {
            logs,
            started_at: p.started_at,
            ended_at: p.ended_at,
        };
        if let Some(dir) = cgroup {
            if let Err(e) = fs::remove_dir(&dir) {
                warn!(job = %job, "cgroup {} not removed: {}", dir.display(), e);
            }
        }
        Ok(harvest)
    }

    fn pin_service(&mut self, cores: CoreSet) -> SchedResult<()> {
        let Some(pid) = self.config.service_pid else {
            debug!(%cores, "no service pid, skipping pin");
            return Ok(());
        };
        for tid in task_ids(pid) {
            set_affinity(tid, cores)
                .map_err(|e| SchedError::backend("memcached", format!("sched_setaffinity({}): {}", tid, e)))?;
        }
        Ok(())
    }
}

// --- CGROUP HELPERS ---

fn controller_list(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .split_whitespace()
        .map(|c| c.trim_start_matches('+').to_string())
        .collect()
}

// CONTROLLERS THE ROOT CANNOT HAND DOWN TO PER-JOB CHILDREN
pub fn missing_controllers(root: &Path) -> Vec<&'static str> {
    let enabled = controller_list(&root.join("cgroup.subtree_control"));
    CGROUP_CONTROLLERS
        .into_iter()
        .filter(|c| !enabled.iter().any(|e| e.as_str() == *c))
        .collect()
}

// CHILDREN ONLY GET cpuset.cpus AND cpu.max IF THE PARENT DELEGATES THEM
fn enable_controllers(root: &Path) -> SchedResult<()> {
    if !root.join("cgroup.controllers").exists() {
        return Err(SchedError::Configuration(format!(
            "{} is not a cgroup v2 directory", root.display()
        )));
    }
    let missing = missing_controllers(root);
    if missing.is_empty() {
        return Ok(());
    }
    let available = controller_list(&root.join("cgroup.controllers"));
    if let Some(c) = missing.iter().find(|c| !available.iter().any(|a| a.as_str() == **c)) {
        return Err(SchedError::Configuration(format!(
            "{}: {} controller not available", root.display(), c
        )));
    }
    let request = missing.iter().map(|c| format!("+{}", c)).collect::<Vec<_>>().join(" ");
    write_knob(&root.join("cgroup.subtree_control"), &request).map_err(|e| {
        SchedError::Configuration(format!("{}: cannot enable {}: {}", root.display(), request, e))
    })?;
    let still = missing_controllers(root);
    if !still.is_empty() {
        return Err(SchedError::Configuration(format!(
            "{}: {} not delegated to children", root.display(), still.join(" ")
        )));
    }
    debug!(root = %root.display(), %request, "cgroup controllers enabled");
    Ok(())
}

// --- AFFINITY HELPERS ---

fn set_affinity(tid: i32, cores: CoreSet) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for c in cores.iter() {
            libc::CPU_SET(c as usize, &mut set);
        }
        if libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn write_knob(path: &Path, value: &str) -> std::io::Result<()> {
    fs::write(path, value)
}

fn task_ids(pid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir(format!("/proc/{}/task", pid)) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse().ok())
        .collect()
}

// PROCESS GROUP ID: FIELD 5 OF /proc/<pid>/stat
fn pgrp_of(pid: i32) -> Option<i32> {
    let raw = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &raw[raw.rfind(')')? + 1..];
    rest.split_whitespace().nth(2)?.parse().ok()
}

// EVERY THREAD OF EVERY PROCESS IN THE GROUP
fn group_tids(pgid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
        .filter(|&pid| pgrp_of(pid) == Some(pgid))
        .flat_map(task_ids)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_command_template() {
        let cfg = ProcessConfig {
            command: "./run -a run -S {suite} -p {job} -i native -n {threads}".into(),
            workdir: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            cgroup_root: None,
            service_pid: None,
        };
        assert_eq!(
            cfg.render(JobName::Radix, 1),
            "./run -a run -S splash2x -p radix -i native -n 1"
        );
        assert_eq!(
            cfg.render(JobName::Ferret, 3),
            "./run -a run -S parsec -p ferret -i native -n 3"
        );
    }

    #[test]
    fn own_process_group_is_found() {
        let pid = std::process::id() as i32;
        let pgid = pgrp_of(pid).unwrap();
        assert!(pgid > 0);
        assert!(!task_ids(pid).is_empty());
    }

    fn config(dir: &Path, command: &str, cgroup_root: Option<PathBuf>) -> ProcessConfig {
        ProcessConfig {
            command: command.into(),
            workdir: dir.to_path_buf(),
            log_dir: dir.join("job-output"),
            cgroup_root,
            service_pid: None,
        }
    }

    // A DIRECTORY THAT LOOKS LIKE A DELEGATING CGROUP V2 ROOT
    fn fake_cgroup_root(dir: &Path, subtree: &str) -> PathBuf {
        let root = dir.join("cg");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("cgroup.controllers"), "cpuset cpu io memory pids\n").unwrap();
        fs::write(root.join("cgroup.subtree_control"), subtree).unwrap();
        root
    }

    fn wait_exit(backend: &mut ProcessBackend, job: JobName) -> JobStatus {
        for _ in 0..200 {
            let status = backend.status(job).unwrap();
            if status == JobStatus::Exited {
                return status;
            }
            std::thread::sleep(std::time::Duration::from_millis(25));
        }
        backend.status(job).unwrap()
    }

    fn kill(backend: &ProcessBackend, job: JobName) {
        if let Some(c) = backend.procs[&job].child.as_ref() {
            unsafe { libc::killpg(c.id() as i32, libc::SIGKILL) };
        }
    }

    // === LIFECYCLE ===

    #[test]
    fn start_pause_unpause_harvest() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = ProcessBackend::new(config(dir.path(), "echo {job} {threads}; sleep 1", None)).unwrap();
        b.create(JobName::Radix, 1).unwrap();
        assert_eq!(b.status(JobName::Radix).unwrap(), JobStatus::NotCreated);

        b.update_cores(JobName::Radix, CoreSet::of(&[0]), 1.0).unwrap();
        b.start(JobName::Radix).unwrap();
        assert_eq!(b.status(JobName::Radix).unwrap(), JobStatus::Running);
        assert!(b.harvest(JobName::Radix).is_err());

        b.pause(JobName::Radix).unwrap();
        assert_eq!(b.status(JobName::Radix).unwrap(), JobStatus::Paused);
        assert!(b.pause(JobName::Radix).is_err());
        b.unpause(JobName::Radix).unwrap();
        assert_eq!(b.status(JobName::Radix).unwrap(), JobStatus::Running);

        assert_eq!(wait_exit(&mut b, JobName::Radix), JobStatus::Exited);
        assert!(b.update_cores(JobName::Radix, CoreSet::of(&[0]), 1.0).is_err());
        let h = b.harvest(JobName::Radix).unwrap();
        assert_eq!(String::from_utf8_lossy(&h.logs).trim(), "radix 1");
        assert!(h.started_at.is_some() && h.ended_at.is_some());
        assert!(h.started_at <= h.ended_at);
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = ProcessBackend::new(config(dir.path(), "sleep 30", None)).unwrap();
        b.create(JobName::Dedup, 1).unwrap();
        assert!(b.create(JobName::Dedup, 1).is_err());
        b.start(JobName::Dedup).unwrap();
        let err = b.start(JobName::Dedup).unwrap_err();
        assert!(err.is_recoverable());
        kill(&b, JobName::Dedup);
        assert_eq!(wait_exit(&mut b, JobName::Dedup), JobStatus::Exited);
    }

    #[test]
    fn failed_placement_leaves_job_startable() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_cgroup_root(dir.path(), "cpuset cpu\n");
        let mut b = ProcessBackend::new(config(dir.path(), "sleep 30", Some(root.clone()))).unwrap();
        b.create(JobName::Blackscholes, 2).unwrap();
        b.update_cores(JobName::Blackscholes, CoreSet::of(&[2, 3]), 2.0).unwrap();

        // ATTACH FAILS: cgroup.procs CANNOT BE WRITTEN
        let procs = root.join("blackscholes").join("cgroup.procs");
        fs::create_dir(&procs).unwrap();
        let err = b.start(JobName::Blackscholes).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(b.status(JobName::Blackscholes).unwrap(), JobStatus::NotCreated);
        assert!(b.procs[&JobName::Blackscholes].child.is_none());
        assert!(b.procs[&JobName::Blackscholes].started_at.is_none());
        assert_eq!(b.procs[&JobName::Blackscholes].pending, Some((CoreSet::of(&[2, 3]), 2.0)));

        fs::remove_dir(&procs).unwrap();
        b.start(JobName::Blackscholes).unwrap();
        assert_eq!(b.status(JobName::Blackscholes).unwrap(), JobStatus::Running);
        let cg = root.join("blackscholes");
        assert_eq!(fs::read_to_string(cg.join("cpuset.cpus")).unwrap(), "2,3");
        assert_eq!(fs::read_to_string(cg.join("cpu.max")).unwrap(), "200000 100000");

        kill(&b, JobName::Blackscholes);
        assert_eq!(wait_exit(&mut b, JobName::Blackscholes), JobStatus::Exited);
    }

    // === CGROUP ROOT ===

    #[test]
    fn controllers_enabled_on_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_cgroup_root(dir.path(), "");
        assert_eq!(missing_controllers(&root), vec!["cpuset", "cpu"]);
        ProcessBackend::new(config(dir.path(), "true", Some(root.clone()))).unwrap();
        assert!(missing_controllers(&root).is_empty());
    }

    #[test]
    fn root_without_cpuset_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_cgroup_root(dir.path(), "");
        fs::write(root.join("cgroup.controllers"), "cpu io memory\n").unwrap();
        let err = ProcessBackend::new(config(dir.path(), "true", Some(root))).err().unwrap();
        assert!(matches!(err, SchedError::Configuration(_)));

        let plain = dir.path().join("plain");
        fs::create_dir(&plain).unwrap();
        let err = ProcessBackend::new(config(dir.path(), "true", Some(plain))).err().unwrap();
        assert!(matches!(err, SchedError::Configuration(_)));
    }
}
