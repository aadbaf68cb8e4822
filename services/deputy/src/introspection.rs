//! Periodic self-accounting.
//!
//! Counters accumulate between MARKs; every mark logs a two-line summary of
//! the deputy's own footprint and the order traffic seen, then resets.

use std::collections::HashSet;

use tracing::info;

use crate::probe;

/// Order-traffic counters since the last MARK.
#[derive(Debug, Default)]
pub struct MarkCounters {
    /// Orders observed on the bus, any host.
    pub orders_seen: u32,
    /// Orders addressed to this deputy.
    pub orders_for_me: u32,
    /// Orders for this deputy dropped as stale.
    pub stale_orders: u32,
    /// Distinct sheriff names seen since the last MARK.
    pub observed_sheriffs: HashSet<String>,
    /// Most recently observed sheriff.
    pub last_sheriff_name: Option<String>,
}

impl MarkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_order(&mut self) {
        self.orders_seen += 1;
    }

    pub fn record_order_for_me(&mut self) {
        self.orders_for_me += 1;
    }

    pub fn record_stale(&mut self) {
        self.stale_orders += 1;
    }

    pub fn record_sheriff(&mut self, name: &str) {
        if !self.observed_sheriffs.contains(name) {
            self.observed_sheriffs.insert(name.to_string());
        }
        if self.last_sheriff_name.as_deref() != Some(name) {
            self.last_sheriff_name = Some(name.to_string());
        }
    }

    /// Log the MARK summary and reset the per-interval state.
    ///
    /// `last_sheriff_name` deliberately survives the reset; it tracks the
    /// most recent sender, not the interval.
    pub fn mark(&mut self, ncommands: usize, nrunning: usize) {
        let own = probe::read_process(std::process::id()).unwrap_or_default();
        info!(
            rss_kb = own.rss / 1024,
            vsz_kb = own.vsize / 1024,
            commands = ncommands,
            alive = nrunning,
            "MARK"
        );
        info!(
            orders = self.orders_seen,
            forme = self.orders_for_me,
            stale = self.stale_orders,
            sheriffs = self.observed_sheriffs.len(),
            "MARK traffic"
        );

        self.orders_seen = 0;
        self.orders_for_me = 0;
        self.stale_orders = 0;
        self.observed_sheriffs.clear();
    }
}
