//! Info publisher: everything the deputy says on the bus.
//!
//! Two message kinds go out: printf (child output and status notices,
//! attributed by sheriff id) and info (the full observed-state snapshot).
//! Publish failures are logged and the deputy carries on; the transport
//! retries on its own.

use std::sync::Arc;

use tracing::{debug, warn};

use posse_bus::Bus;
use posse_messages::{timestamp_now, CommandInfo, InfoMessage, PrintfMessage};

use crate::probe::SystemSample;

pub struct Publisher {
    bus: Arc<dyn Bus>,
    deputy_name: String,
    /// Mirror printf text onto the deputy's own stderr.
    verbose: bool,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>, deputy_name: String, verbose: bool) -> Self {
        Self {
            bus,
            deputy_name,
            verbose,
        }
    }

    /// Send one printf, attributed to `sheriff_id` (0 = unattributed).
    pub async fn transmit_str(&self, sheriff_id: i32, text: &str) {
        if self.verbose {
            eprint!("{text}");
        }
        let msg = PrintfMessage {
            deputy_name: self.deputy_name.clone(),
            sheriff_id,
            text: text.to_string(),
            utime: timestamp_now(),
        };
        if let Err(e) = self.bus.publish_printf(&msg).await {
            warn!(error = %e, sheriff_id, "printf publish failed");
        }
    }

    /// Broadcast the observed-state snapshot.
    pub async fn transmit_info(&self, cpu_load: f32, sys: &SystemSample, cmds: Vec<CommandInfo>) {
        if self.verbose {
            debug!(ncmds = cmds.len(), "transmitting deputy info");
        }
        let msg = InfoMessage {
            utime: timestamp_now(),
            host: self.deputy_name.clone(),
            cpu_load,
            phys_mem_total_bytes: sys.mem_total,
            phys_mem_free_bytes: sys.mem_free,
            swap_total_bytes: sys.swap_total,
            swap_free_bytes: sys.swap_free,
            cmds,
        };
        if let Err(e) = self.bus.publish_info(&msg).await {
            warn!(error = %e, "info publish failed");
        }
    }
}
