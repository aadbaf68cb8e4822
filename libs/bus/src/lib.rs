//! # posse-bus
//!
//! Pub/sub transport abstraction for posse messages.
//!
//! The deputy core is written against the [`Bus`] trait and never touches a
//! wire format. Two things live here:
//! - the trait itself, with typed publish/subscribe per message kind;
//! - [`MemoryBus`], a process-local broadcast implementation backing the
//!   `mem://` scheme, used by tests and single-process deployments.
//!
//! Transport URLs are passed opaquely from the command line to [`connect`];
//! an unrecognized scheme is a startup-fatal [`BusError`].

mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use posse_messages::{InfoMessage, OrdersMessage, PrintfMessage};

pub use memory::MemoryBus;

/// Errors from the bus layer.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport URL names a scheme this build does not support.
    #[error("unsupported bus transport: {0}")]
    UnsupportedTransport(String),

    /// The transport URL could not be parsed.
    #[error("malformed bus url: {0}")]
    MalformedUrl(String),

    /// A publish was dropped by the transport.
    #[error("publish failed on {channel}")]
    PublishFailed {
        /// Channel the message was addressed to.
        channel: &'static str,
    },
}

/// Typed pub/sub handle for posse traffic.
///
/// Publishes never block on slow subscribers; subscriptions are broadcast
/// receivers that lag (drop oldest) rather than backpressure the publisher.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a desired-state snapshot (sheriff side).
    async fn publish_orders(&self, msg: &OrdersMessage) -> Result<(), BusError>;

    /// Publish an observed-state snapshot (deputy side).
    async fn publish_info(&self, msg: &InfoMessage) -> Result<(), BusError>;

    /// Publish captured output or a status notice (deputy side).
    async fn publish_printf(&self, msg: &PrintfMessage) -> Result<(), BusError>;

    /// Subscribe to sheriff orders.
    fn subscribe_orders(&self) -> broadcast::Receiver<OrdersMessage>;

    /// Subscribe to deputy state snapshots.
    fn subscribe_info(&self) -> broadcast::Receiver<InfoMessage>;

    /// Subscribe to captured output.
    fn subscribe_printf(&self) -> broadcast::Receiver<PrintfMessage>;
}

/// Open a bus handle for the given transport URL.
///
/// `mem://<name>` attaches to (creating on first use) the process-local bus
/// registered under `<name>`, so co-located publishers and subscribers meet
/// on the same instance.
pub fn connect(url: &str) -> Result<Arc<dyn Bus>, BusError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| BusError::MalformedUrl(url.to_string()))?;

    match scheme {
        "mem" => Ok(memory::shared(rest)),
        other => Err(BusError::UnsupportedTransport(other.to_string())),
    }
}
