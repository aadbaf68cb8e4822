//! Sheriff orders: the authoritative desired-state list for one host.

use serde::{Deserialize, Serialize};

/// One command the sheriff wants managed on the addressed host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheriffCommand {
    /// Stable identity chosen by the sheriff, unique within a deputy.
    pub sheriff_id: i32,

    /// Command line to execute (argv-equivalent text).
    pub name: String,

    /// Human-readable label.
    pub nickname: String,

    /// Path-like grouping, e.g. `"vision/cameras"`.
    pub group: String,

    /// Monotonic run token. Bumping it requests a stop-then-start cycle.
    pub desired_runid: i32,

    /// When set, the command must end up stopped regardless of runid.
    pub force_quit: bool,
}

/// A full desired-state snapshot for one host.
///
/// Orders always carry the complete list: any locally managed command whose
/// `sheriff_id` is absent from `cmds` is to be culled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdersMessage {
    /// Host these orders are addressed to. Other deputies ignore the message.
    pub host: String,

    /// Name of the issuing sheriff.
    pub sheriff_name: String,

    /// Issue time, microseconds since the Unix epoch.
    pub utime: i64,

    /// Desired command set.
    pub cmds: Vec<SheriffCommand>,
}

impl OrdersMessage {
    /// Look up an ordered command by sheriff id.
    pub fn find(&self, sheriff_id: i32) -> Option<&SheriffCommand> {
        self.cmds.iter().find(|c| c.sheriff_id == sheriff_id)
    }
}
