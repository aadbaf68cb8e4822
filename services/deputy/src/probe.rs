//! Resource probe: one-shot snapshots of system and per-pid counters.
//!
//! Stateless readers over `/proc`; whoever wants rates keeps the previous
//! snapshot and computes deltas. On any error callers substitute zeros and
//! carry on; a missing counter must never take the deputy down.

use std::fs;

use crate::error::DeputyError;

/// Host-wide CPU jiffies and memory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemSample {
    /// Jiffies spent in user mode.
    pub user: u64,
    /// Jiffies spent in user mode at low priority (nice).
    pub user_low: u64,
    /// Jiffies spent in kernel mode.
    pub system: u64,
    /// Idle jiffies.
    pub idle: u64,

    /// Total physical memory in bytes.
    pub mem_total: u64,
    /// Free physical memory in bytes.
    pub mem_free: u64,
    /// Total swap in bytes.
    pub swap_total: u64,
    /// Free swap in bytes.
    pub swap_free: u64,
}

/// Per-process CPU jiffies and memory sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSample {
    /// Jiffies this process spent in user mode.
    pub user: u64,
    /// Jiffies this process spent in kernel mode.
    pub system: u64,
    /// Virtual memory size in bytes.
    pub vsize: u64,
    /// Resident set size in bytes.
    pub rss: u64,
}

/// Snapshot host-wide CPU and memory counters.
pub fn read_system() -> Result<SystemSample, DeputyError> {
    let stat = fs::read_to_string("/proc/stat").map_err(DeputyError::ProbeFailed)?;
    let meminfo = fs::read_to_string("/proc/meminfo").map_err(DeputyError::ProbeFailed)?;
    parse_system(&stat, &meminfo)
}

/// Snapshot one process's CPU and memory counters.
pub fn read_process(pid: u32) -> Result<ProcessSample, DeputyError> {
    let stat =
        fs::read_to_string(format!("/proc/{pid}/stat")).map_err(DeputyError::ProbeFailed)?;
    parse_process(&stat, page_size())
}

fn malformed(what: &str) -> DeputyError {
    DeputyError::ProbeFailed(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("malformed {what}"),
    ))
}

fn parse_system(stat: &str, meminfo: &str) -> Result<SystemSample, DeputyError> {
    let mut sample = SystemSample::default();

    // First line of /proc/stat: "cpu  user nice system idle ..."
    let cpu = stat
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("cpu "))
        .ok_or_else(|| malformed("/proc/stat"))?;
    let mut jiffies = cpu.split_whitespace().map(|f| f.parse::<u64>());
    let mut next = || -> Result<u64, DeputyError> {
        jiffies
            .next()
            .and_then(Result::ok)
            .ok_or_else(|| malformed("/proc/stat"))
    };
    sample.user = next()?;
    sample.user_low = next()?;
    sample.system = next()?;
    sample.idle = next()?;

    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        // /proc/meminfo reports kB.
        let bytes = value.parse::<u64>().unwrap_or(0) * 1024;
        match key {
            "MemTotal:" => sample.mem_total = bytes,
            "MemFree:" => sample.mem_free = bytes,
            "SwapTotal:" => sample.swap_total = bytes,
            "SwapFree:" => sample.swap_free = bytes,
            _ => {}
        }
    }

    Ok(sample)
}

fn parse_process(stat: &str, page_size: u64) -> Result<ProcessSample, DeputyError> {
    // The comm field is parenthesized and may itself contain spaces or
    // parentheses, so split after the last ')'.
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| malformed("/proc/pid/stat"))?;

    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Fields are 1-indexed in proc(5); `rest` starts at field 3 (state).
    let field = |n: usize| -> Result<u64, DeputyError> {
        fields
            .get(n - 3)
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| malformed("/proc/pid/stat"))
    };

    Ok(ProcessSample {
        user: field(14)?,
        system: field(15)?,
        vsize: field(23)?,
        rss: field(24)? * page_size,
    })
}

/// Total jiffies elapsed between two host samples.
///
/// Saturating per-term, so a counter reset (or a zero sample substituted
/// after a probe error) degrades to "no time elapsed" instead of nonsense.
pub fn elapsed_jiffies(a: &SystemSample, b: &SystemSample) -> u64 {
    a.user.saturating_sub(b.user)
        + a.user_low.saturating_sub(b.user_low)
        + a.system.saturating_sub(b.system)
        + a.idle.saturating_sub(b.idle)
}

/// Host CPU load between two samples, 0.0 to 1.0.
pub fn cpu_load(a: &SystemSample, b: &SystemSample) -> f32 {
    let elapsed = elapsed_jiffies(a, b);
    if elapsed == 0 {
        return 0.0;
    }
    let loaded = a.user.saturating_sub(b.user)
        + a.user_low.saturating_sub(b.user_low)
        + a.system.saturating_sub(b.system);
    loaded as f32 / elapsed as f32
}

/// One process's share of host CPU between two samples.
///
/// Zero until a full previous sample exists, and zero when no host time
/// elapsed.
pub fn process_cpu_usage(elapsed: u64, pa: &ProcessSample, pb: &ProcessSample) -> f32 {
    if elapsed == 0 || pb.user == 0 || pb.system == 0 {
        return 0.0;
    }
    let used = pa.user.saturating_sub(pb.user) + pa.system.saturating_sub(pb.system);
    used as f32 / elapsed as f32
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}
