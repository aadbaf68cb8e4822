//! Deputy-to-sheriff traffic: state snapshots and captured output.

use serde::{Deserialize, Serialize};

/// Observed state of one managed command, as reported in an [`InfoMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Command line the deputy will use on the next start.
    pub name: String,

    /// Human-readable label.
    pub nickname: String,

    /// Grouping path.
    pub group: String,

    /// Run token of the currently (or most recently) started instance.
    pub actual_runid: i32,

    /// OS pid, 0 when not running.
    pub pid: u32,

    /// Raw wait status of the last terminated instance; meaningful only after
    /// termination.
    pub exit_code: i32,

    /// Sheriff-assigned identity.
    pub sheriff_id: i32,

    /// Fraction of host CPU consumed over the last sample interval.
    pub cpu_usage: f32,

    /// Virtual memory size in bytes.
    pub mem_vsize_bytes: u64,

    /// Resident set size in bytes.
    pub mem_rss_bytes: u64,
}

/// A deputy's periodic observed-state snapshot.
///
/// Emitted at 1 Hz and opportunistically after any reconciliation action or
/// reap, so the sheriff converges on fresh state without polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    /// Snapshot time, microseconds since the Unix epoch.
    pub utime: i64,

    /// Reporting deputy's host name.
    pub host: String,

    /// Host CPU load over the last sample interval, 0.0 to 1.0.
    pub cpu_load: f32,

    /// Total physical memory in bytes.
    pub phys_mem_total_bytes: u64,

    /// Free physical memory in bytes.
    pub phys_mem_free_bytes: u64,

    /// Total swap in bytes.
    pub swap_total_bytes: u64,

    /// Free swap in bytes.
    pub swap_free_bytes: u64,

    /// Per-command observed state.
    pub cmds: Vec<CommandInfo>,
}

/// Captured child output or a deputy status notice.
///
/// `sheriff_id` attributes the text to a managed command; 0 means the notice
/// is not attributable to any single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintfMessage {
    /// Emitting deputy's host name.
    pub deputy_name: String,

    /// Command the text belongs to, or 0 when unattributed.
    pub sheriff_id: i32,

    /// Verbatim bytes, forwarded as UTF-8 (lossy for non-UTF-8 output).
    pub text: String,

    /// Emission time, microseconds since the Unix epoch.
    pub utime: i64,
}
