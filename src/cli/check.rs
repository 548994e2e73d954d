use std::io::Read;
use std::path::Path;

use anyhow::Result;

use colocate::backend::missing_controllers;
use colocate::cores::NR_CORES;
use colocate::metrics::{parse_meminfo, parse_net_dev, parse_proc_stat};

const KERNEL_OPTIONS: [&str; 3] = ["CONFIG_CGROUPS=y", "CONFIG_CPUSETS=y", "CONFIG_CFS_BANDWIDTH=y"];

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }
    let mut ok = true;
    for option in KERNEL_OPTIONS {
        let name = option.trim_end_matches("=y");
        if config.lines().any(|l| l == option) {
            println!("  {:<22}OK", name);
        } else {
            println!("  {:<22}NOT SET -- quota enforcement unavailable", name);
            ok = false;
        }
    }
    ok
}

// PER-JOB CHILDREN NEED cpuset AND cpu DELEGATED BY THE ROOT
fn check_cgroup_root(root: &Path) -> bool {
    if !root.join("cgroup.controllers").exists() {
        println!("  --cgroup-root         NOT A CGROUP V2 DIRECTORY ({})", root.display());
        return false;
    }
    let missing = missing_controllers(root);
    if missing.is_empty() {
        println!("  --cgroup-root         OK ({})", root.display());
    } else {
        println!("  --cgroup-root         {} NOT IN subtree_control ({})", missing.join(" "), root.display());
        println!("                        the run will try to enable them and fail if it cannot");
    }
    true
}

// EACH SAMPLER INPUT MUST EXIST AND PARSE
fn check_procfs() -> bool {
    let mut ok = true;
    let mut report = |name: &str, parsed: bool| {
        println!("  {:<22}{}", name, if parsed { "OK" } else { "UNUSABLE" });
        ok &= parsed;
    };

    let stat = std::fs::read_to_string("/proc/stat").unwrap_or_default();
    report("/proc/stat", parse_proc_stat(&stat).len() >= NR_CORES);

    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    report("/proc/meminfo", parse_meminfo(&meminfo).is_some());

    let netdev = std::fs::read_to_string("/proc/net/dev").unwrap_or_default();
    report("/proc/net/dev", netdev.lines().count() > 2);
    if parse_net_dev(&netdev) == 0 {
        println!("  {:<22}NO PACKETS SEEN YET (net model reads 0)", "");
    }
    ok
}

pub fn run_check(cgroup_root: Option<&Path>) -> Result<()> {
    println!("COLOCATE HOST CHECK");
    println!();

    let mut ok = true;

    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online >= NR_CORES as i64 {
        println!("  {:<22}OK ({} online)", "cpus", online);
    } else {
        println!("  {:<22}TOO FEW ({} online, need {})", "cpus", online, NR_CORES);
        ok = false;
    }
    println!();

    println!("PROCFS:");
    if !check_procfs() {
        ok = false;
    }
    println!();

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    let cgroup2 = Path::new("/sys/fs/cgroup/cgroup.controllers");
    if cgroup2.exists() {
        let controllers = std::fs::read_to_string(cgroup2).unwrap_or_default();
        let has = |c: &str| controllers.split_whitespace().any(|x| x == c);
        if has("cpuset") && has("cpu") {
            println!("  cgroup v2             OK ({})", controllers.trim());
        } else {
            println!("  cgroup v2             MISSING cpu/cpuset CONTROLLERS ({})", controllers.trim());
            println!("                        run without --cgroup-root (affinity only, no quota)");
        }
    } else {
        println!("  cgroup v2             NOT MOUNTED (affinity only, no quota)");
    }
    if let Some(root) = cgroup_root {
        if !check_cgroup_root(root) {
            ok = false;
        }
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
