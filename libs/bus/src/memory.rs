//! Process-local broadcast bus.
//!
//! Backs the `mem://` scheme. Each message kind gets its own broadcast
//! channel; a publish with no live subscribers is not an error (the original
//! transport is fire-and-forget multicast, and this keeps that contract).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use posse_messages::{
    InfoMessage, OrdersMessage, PrintfMessage, INFO_CHANNEL, ORDERS_CHANNEL, PRINTF_CHANNEL,
};

use crate::{Bus, BusError};

/// Broadcast depth per channel. Subscribers that fall further behind than
/// this lag (drop oldest) rather than stall the publisher.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus: one broadcast channel per message kind.
pub struct MemoryBus {
    orders_tx: broadcast::Sender<OrdersMessage>,
    info_tx: broadcast::Sender<InfoMessage>,
    printf_tx: broadcast::Sender<PrintfMessage>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            orders_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            info_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            printf_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish_orders(&self, msg: &OrdersMessage) -> Result<(), BusError> {
        trace!(channel = ORDERS_CHANNEL, host = %msg.host, ncmds = msg.cmds.len(), "publish");
        let _ = self.orders_tx.send(msg.clone());
        Ok(())
    }

    async fn publish_info(&self, msg: &InfoMessage) -> Result<(), BusError> {
        trace!(channel = INFO_CHANNEL, host = %msg.host, ncmds = msg.cmds.len(), "publish");
        let _ = self.info_tx.send(msg.clone());
        Ok(())
    }

    async fn publish_printf(&self, msg: &PrintfMessage) -> Result<(), BusError> {
        trace!(channel = PRINTF_CHANNEL, sheriff_id = msg.sheriff_id, "publish");
        let _ = self.printf_tx.send(msg.clone());
        Ok(())
    }

    fn subscribe_orders(&self) -> broadcast::Receiver<OrdersMessage> {
        self.orders_tx.subscribe()
    }

    fn subscribe_info(&self) -> broadcast::Receiver<InfoMessage> {
        self.info_tx.subscribe()
    }

    fn subscribe_printf(&self) -> broadcast::Receiver<PrintfMessage> {
        self.printf_tx.subscribe()
    }
}

/// Process-wide registry of named `mem://` buses.
fn registry() -> &'static Mutex<HashMap<String, Arc<MemoryBus>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemoryBus>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Attach to the named process-local bus, creating it on first use.
pub(crate) fn shared(name: &str) -> Arc<dyn Bus> {
    let mut buses = registry().lock().expect("bus registry poisoned");
    buses
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(MemoryBus::new()))
        .clone()
}
