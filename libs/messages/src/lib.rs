//! # posse-messages
//!
//! Wire message types for the posse process-supervision protocol.
//!
//! Three message kinds travel over the bus:
//! - [`OrdersMessage`]: the sheriff's authoritative desired-state list for
//!   one host, published on [`ORDERS_CHANNEL`].
//! - [`InfoMessage`]: a deputy's periodic observed-state snapshot, published
//!   on [`INFO_CHANNEL`].
//! - [`PrintfMessage`]: captured child output and status notices, published
//!   on [`PRINTF_CHANNEL`].
//!
//! The codec and transport live behind the `posse-bus` trait; this crate only
//! defines the shapes and the protocol constants both sides must agree on.

mod info;
mod orders;

pub use info::{CommandInfo, InfoMessage, PrintfMessage};
pub use orders::{OrdersMessage, SheriffCommand};

/// Channel carrying sheriff orders to deputies.
pub const ORDERS_CHANNEL: &str = "POSSE_ORDERS";

/// Channel carrying deputy state snapshots back to sheriffs.
pub const INFO_CHANNEL: &str = "POSSE_INFO";

/// Channel carrying captured child output and deputy notices.
pub const PRINTF_CHANNEL: &str = "POSSE_PRINTF";

/// Orders whose `utime` is older than this are rejected as stale.
///
/// Microseconds. Deputies compare against their own wall clock, so this also
/// bounds tolerated clock skew between sheriff and deputy.
pub const MAX_MESSAGE_AGE_USEC: i64 = 60_000_000;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn timestamp_now() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
