//! The managed-command record.
//!
//! One `Command` per sheriff-assigned id: the command line and metadata from
//! the latest orders, plus the live run state (child handle, merged output
//! pipe, kill-escalation bookkeeping, CPU samples).

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::time::Instant;

use posse_messages::CommandInfo;

use crate::probe::ProcessSample;

/// Minimum gap between two signals sent by the stop escalation.
pub const KILL_RATE_LIMIT: Duration = Duration::from_millis(900);

/// Number of SIGTERMs sent before the escalation switches to SIGKILL.
pub const MAX_TERM_ATTEMPTS: u32 = 5;

/// Coarse run state; `Running` iff a live child exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Stopped,
    Running,
}

/// A command under this deputy's management.
#[derive(Debug)]
pub struct Command {
    /// Sheriff-assigned identity; unique across the set.
    pub sheriff_id: i32,

    /// Command line used on the next start. Renames apply here without
    /// touching a live child.
    pub exec_str: String,

    /// Human-readable label.
    pub nickname: String,

    /// Grouping path.
    pub group: String,

    /// Run token of the currently-started instance. Assigned only on a
    /// successful start, so a failed spawn stays behind `desired_runid` and
    /// the next orders receipt retries.
    pub actual_runid: i32,

    /// OS pid; 0 while not running.
    pub pid: u32,

    /// Live child handle while running.
    pub child: Option<Child>,

    /// Whether the merged-output pipe is still registered with the loop.
    pub output_open: bool,

    /// Wait status of the last terminated instance.
    pub exit_status: Option<ExitStatus>,

    /// Signals sent by the current stop escalation.
    pub num_kills_sent: u32,

    /// When the escalation last sent a signal.
    pub last_kill_time: Option<Instant>,

    /// CPU fraction over the last sample interval.
    pub cpu_usage: f32,

    /// Previous and current per-process samples for delta computation.
    pub proc_samples: [ProcessSample; 2],

    /// Set when the cull path wants this command deleted once its child is
    /// reaped.
    pub remove_requested: bool,
}

impl Command {
    /// Insert-time constructor: a stopped command with no history.
    pub fn new(sheriff_id: i32, exec_str: &str, nickname: &str, group: &str) -> Self {
        Self {
            sheriff_id,
            exec_str: exec_str.to_string(),
            nickname: nickname.to_string(),
            group: group.to_string(),
            actual_runid: 0,
            pid: 0,
            child: None,
            output_open: false,
            exit_status: None,
            num_kills_sent: 0,
            last_kill_time: None,
            cpu_usage: 0.0,
            proc_samples: [ProcessSample::default(); 2],
            remove_requested: false,
        }
    }

    pub fn status(&self) -> CommandStatus {
        if self.pid != 0 {
            CommandStatus::Running
        } else {
            CommandStatus::Stopped
        }
    }

    /// What the stop escalation should send right now, if anything.
    ///
    /// `None` when the command is not running or the 900 ms rate limit has
    /// not elapsed since the previous signal. The first [`MAX_TERM_ATTEMPTS`]
    /// signals are SIGTERM; after that, SIGKILL.
    pub fn next_stop_signal(&self, now: Instant) -> Option<Signal> {
        if self.pid == 0 {
            return None;
        }
        if let Some(last) = self.last_kill_time {
            if now < last + KILL_RATE_LIMIT {
                return None;
            }
        }
        if self.num_kills_sent >= MAX_TERM_ATTEMPTS {
            Some(Signal::SIGKILL)
        } else {
            Some(Signal::SIGTERM)
        }
    }

    /// Snapshot for an info broadcast.
    pub fn to_info(&self) -> CommandInfo {
        CommandInfo {
            name: self.exec_str.clone(),
            nickname: self.nickname.clone(),
            group: self.group.clone(),
            actual_runid: self.actual_runid,
            pid: self.pid,
            exit_code: self.exit_status.map(ExitStatus::into_raw).unwrap_or(0),
            sheriff_id: self.sheriff_id,
            cpu_usage: self.cpu_usage,
            mem_vsize_bytes: self.proc_samples[1].vsize,
            mem_rss_bytes: self.proc_samples[1].rss,
        }
    }
}

/// Split a command line into argv, honoring single/double quotes and
/// backslash escapes. Quoting errors fall back to taking the rest verbatim.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            (Some(_), _) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                    in_word = true;
                }
            }
            (None, _) if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, _) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        argv.push(current);
    }
    argv
}
