// src/container/procfs.rs

//! Process accounting from `/proc`
//!
//! Used for `processes()` on every backend that runs payloads as host
//! processes, and for `stats()` when no cgroup is available.

use crate::container::{ProcessInfo, ResourceStats};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Fields of `/proc/<pid>/stat` the runtime uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
    /// Clock ticks in user mode
    pub utime: u64,
    /// Clock ticks in kernel mode
    pub stime: u64,
    /// Clock ticks after boot at which the process started
    pub starttime: u64,
    /// Resident set in pages
    pub rss_pages: u64,
}

/// Parse a stat line; the command name may itself contain spaces and parens
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_string();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let field = |n: usize| rest.get(n - 3).and_then(|v| v.parse::<u64>().ok());

    Some(ProcStat {
        pid,
        comm,
        ppid: field(4)? as u32,
        utime: field(14)?,
        stime: field(15)?,
        starttime: field(22)?,
        rss_pages: field(24)?,
    })
}

fn clock_ticks() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as u64;
        }
    }
    100
}

fn page_size() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    4096
}

fn uptime_secs(proc_root: &Path) -> Option<f64> {
    fs::read_to_string(proc_root.join("uptime"))
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn read_stat(proc_root: &Path, pid: u32) -> Option<ProcStat> {
    parse_stat(&fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?)
}

/// Average CPU use over the process lifetime, in percent of one CPU
pub fn cpu_percent(stat: &ProcStat, uptime: f64, ticks: u64) -> f32 {
    let ticks = ticks as f64;
    let alive = uptime - stat.starttime as f64 / ticks;
    if alive <= 0.0 {
        return 0.0;
    }
    (((stat.utime + stat.stime) as f64 / ticks) / alive * 100.0) as f32
}

/// Every pid in the tree rooted at `root`, including `root`
pub fn descendants(proc_root: &Path, root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    if let Ok(entries) = fs::read_dir(proc_root) {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(stat) = read_stat(proc_root, pid) {
                children.entry(stat.ppid).or_default().push(pid);
            }
        }
    }

    let mut out = vec![root];
    let mut index = 0;
    while index < out.len() {
        if let Some(kids) = children.get(&out[index]) {
            out.extend(kids.iter().copied());
        }
        index += 1;
    }
    out
}

/// Describe each live pid; pids that exited in the meantime are skipped
pub fn processes(proc_root: &Path, pids: &[u32]) -> Vec<ProcessInfo> {
    let ticks = clock_ticks();
    let page = page_size();
    let uptime = uptime_secs(proc_root).unwrap_or(0.0);
    pids.iter()
        .filter_map(|pid| read_stat(proc_root, *pid))
        .map(|stat| ProcessInfo {
            pid: stat.pid,
            name: stat.comm.clone(),
            rss_bytes: stat.rss_pages * page,
            cpu_percent: cpu_percent(&stat, uptime, ticks),
        })
        .collect()
}

/// Aggregate usage over a set of pids
pub fn stats(proc_root: &Path, pids: &[u32]) -> ResourceStats {
    let ticks = clock_ticks();
    let page = page_size();
    let mut out = ResourceStats::default();
    for stat in pids.iter().filter_map(|pid| read_stat(proc_root, *pid)) {
        out.memory_bytes += stat.rss_pages * page;
        out.cpu_time_us += (stat.utime + stat.stime) * 1_000_000 / ticks;
        out.process_count += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stat_line(pid: u32, comm: &str, ppid: u32) -> String {
        format!(
            "{pid} ({comm}) S {ppid} 1 1 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0 1000 12345678 300 18446744073709551615"
        )
    }

    #[test]
    fn test_parse_stat() {
        let stat = parse_stat(&stat_line(42, "cc1 (plus)", 7)).unwrap();
        assert_eq!(stat.pid, 42);
        assert_eq!(stat.comm, "cc1 (plus)");
        assert_eq!(stat.ppid, 7);
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.starttime, 1000);
        assert_eq!(stat.rss_pages, 300);
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_cpu_percent() {
        let stat = parse_stat(&stat_line(1, "make", 0)).unwrap();
        // started at 10s, 300 ticks = 3s of CPU over 30s alive
        let pct = cpu_percent(&stat, 40.0, 100);
        assert!((pct - 10.0).abs() < 0.01);
        assert_eq!(cpu_percent(&stat, 5.0, 100), 0.0);
    }

    #[test]
    fn test_tree_from_fake_proc() {
        let proc_root = TempDir::new().unwrap();
        for (pid, ppid) in [(10, 1), (11, 10), (12, 11), (20, 1)] {
            let dir = proc_root.path().join(pid.to_string());
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("stat"), stat_line(pid, "sh", ppid)).unwrap();
        }
        fs::write(proc_root.path().join("uptime"), "100.0 50.0\n").unwrap();

        let mut tree = descendants(proc_root.path(), 10);
        tree.sort();
        assert_eq!(tree, vec![10, 11, 12]);

        let listed = processes(proc_root.path(), &tree);
        assert_eq!(listed.len(), 3);
        assert_eq!(stats(proc_root.path(), &[10, 99]).process_count, 1);
    }
}
