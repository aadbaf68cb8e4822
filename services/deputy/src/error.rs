//! Deputy error kinds.
//!
//! Most of these are recovered locally: logged, surfaced to the sheriff as a
//! printf tagged with the affected command's sheriff id, and the deputy keeps
//! going. Only `Fatal` and a failed subscribe abort startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeputyError {
    /// A child could not be forked/exec'd.
    #[error("couldn't start [{command}]: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A signal could not be delivered to a live child.
    #[error("kill: {0}")]
    KillFailed(#[source] nix::Error),

    /// A child's output pipe returned an error.
    #[error("read: {0}")]
    ReadFailed(#[source] std::io::Error),

    /// A `/proc` snapshot could not be taken. Callers substitute zeros.
    #[error("resource probe: {0}")]
    ProbeFailed(#[source] std::io::Error),

    /// Orders were older than the protocol maximum and were dropped.
    #[error("stale orders ({age_sec} seconds old)")]
    StaleOrders { age_sec: i64 },

    /// Orders addressed a different host and were dropped.
    #[error("orders for other host {0}")]
    WrongHost(String),

    /// Transport-layer failure.
    #[error(transparent)]
    Bus(#[from] posse_bus::BusError),

    /// Unrecoverable startup failure.
    #[error("{0}")]
    Fatal(String),
}
