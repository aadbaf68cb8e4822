//! Deputy shell: owns all state and runs the event loop.
//!
//! Single-threaded cooperative dispatch over five sources: bus receipts,
//! signal events, child-output events, the 1 Hz info tick and the 120 s
//! introspection tick, plus a `watch` shutdown channel for embedding in
//! tests. No handler blocks; every wait happens in the `select!`.

use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use posse_bus::Bus;
use posse_messages::{CommandInfo, OrdersMessage};

use crate::command::Command;
use crate::config::DeputyConfig;
use crate::error::DeputyError;
use crate::introspection::MarkCounters;
use crate::probe::{self, ProcessSample, SystemSample};
use crate::publisher::Publisher;
use crate::reconciler;
use crate::signals::{SignalBridge, SignalEvent};
use crate::supervisor::{ChildEvent, Supervisor};

pub struct Deputy {
    config: DeputyConfig,
    bus: Arc<dyn Bus>,
    publisher: Publisher,
    supervisor: Supervisor,
    counters: MarkCounters,
    child_events: mpsc::UnboundedReceiver<ChildEvent>,
    /// Previous and current host samples for delta computation.
    sys_samples: [SystemSample; 2],
    cpu_load: f32,
}

impl Deputy {
    pub fn new(config: DeputyConfig, bus: Arc<dyn Bus>) -> Self {
        let (events_tx, child_events) = mpsc::unbounded_channel();
        let publisher = Publisher::new(bus.clone(), config.host.clone(), config.verbose);
        Self {
            publisher,
            supervisor: Supervisor::new(events_tx),
            counters: MarkCounters::new(),
            child_events,
            sys_samples: [SystemSample::default(); 2],
            cpu_load: 0.0,
            bus,
            config,
        }
    }

    /// Run until a termination signal arrives or `shutdown` flips true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DeputyError> {
        let mut orders_rx = self.bus.subscribe_orders();
        let mut bridge = SignalBridge::install()
            .map_err(|e| DeputyError::Fatal(format!("cannot install signal handlers: {e}")))?;

        let start = tokio::time::Instant::now();
        let mut info_tick =
            tokio::time::interval_at(start + self.config.info_interval, self.config.info_interval);
        let mut mark_tick =
            tokio::time::interval_at(start + self.config.mark_interval, self.config.mark_interval);

        info!(host = %self.config.host, "deputy entering main loop");

        loop {
            tokio::select! {
                biased;

                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown requested");
                        self.shutdown_cleanup().await;
                        break;
                    }
                }

                event = bridge.recv() => match event {
                    SignalEvent::ChildExited => self.reap_and_report().await,
                    SignalEvent::Terminate(name) => {
                        info!(signal = name, "received termination signal, stopping all processes");
                        self.shutdown_cleanup().await;
                        break;
                    }
                },

                received = orders_rx.recv() => match received {
                    Ok(orders) => self.handle_orders(orders).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "orders subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("orders subscription closed, shutting down");
                        self.shutdown_cleanup().await;
                        break;
                    }
                },

                Some(event) = self.child_events.recv() => {
                    self.handle_child_event(event).await;
                }

                _ = info_tick.tick() => {
                    self.update_cpu_times();
                    self.broadcast_info().await;
                }

                _ = mark_tick.tick() => {
                    let ncommands = self.supervisor.len();
                    let nrunning = self.supervisor.running_count();
                    self.counters.mark(ncommands, nrunning);
                }
            }
        }

        info!("deputy main loop stopped");
        Ok(())
    }

    async fn handle_orders(&mut self, orders: OrdersMessage) {
        let result = reconciler::apply_orders(
            &self.config.host,
            &mut self.supervisor,
            &mut self.counters,
            &self.publisher,
            &orders,
        )
        .await;

        match result {
            Ok(true) => self.broadcast_info().await,
            Ok(false) => {}
            Err(DeputyError::WrongHost(host)) => {
                debug!(%host, "ignoring orders for other host");
            }
            Err(DeputyError::StaleOrders { age_sec }) => {
                debug!(age_sec, "ignoring stale orders");
            }
            Err(e) => warn!(error = %e, "orders not applied"),
        }
    }

    async fn handle_child_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Output { sheriff_id, bytes } => {
                let text = String::from_utf8_lossy(&bytes);
                self.publisher.transmit_str(sheriff_id, &text).await;
            }
            ChildEvent::OutputEof { sheriff_id } => {
                debug!(sheriff_id, "end of child output");
                if let Some(cmd) = self.supervisor.get_mut(sheriff_id) {
                    cmd.output_open = false;
                }
                self.publisher
                    .transmit_str(sheriff_id, "deputy: end of output\n")
                    .await;
            }
            ChildEvent::OutputError { sheriff_id, error } => {
                let err = DeputyError::ReadFailed(error);
                warn!(sheriff_id, error = %err, "child output pipe failed");
                let notice = match self.supervisor.get_mut(sheriff_id) {
                    Some(cmd) => {
                        cmd.output_open = false;
                        format!("deputy [{}] {err}\n", cmd.exec_str)
                    }
                    None => format!("deputy: {err}\n"),
                };
                self.publisher.transmit_str(sheriff_id, &notice).await;
            }
        }
    }

    /// SIGCHLD path: reap whatever terminated, report it, broadcast state.
    async fn reap_and_report(&mut self) {
        let reaped = self.supervisor.reap_dead();
        if reaped.is_empty() {
            return;
        }

        for r in &reaped {
            if let Some(signum) = r.status.signal() {
                let text = format!("{}\n", signal_description(signum));
                self.publisher.transmit_str(r.sheriff_id, &text).await;
                if r.status.core_dumped() {
                    self.publisher
                        .transmit_str(r.sheriff_id, "Core dumped.\n")
                        .await;
                }
            }
        }

        self.broadcast_info().await;
    }

    /// Refresh host and per-child CPU/memory samples and recompute usage.
    fn update_cpu_times(&mut self) {
        self.sys_samples[1] = match probe::read_system() {
            Ok(sample) => sample,
            Err(e) => {
                debug!(error = %e, "system probe failed");
                SystemSample::default()
            }
        };
        let elapsed = probe::elapsed_jiffies(&self.sys_samples[1], &self.sys_samples[0]);
        self.cpu_load = probe::cpu_load(&self.sys_samples[1], &self.sys_samples[0]);

        for cmd in self.supervisor.commands_mut() {
            if cmd.pid != 0 {
                match probe::read_process(cmd.pid) {
                    Ok(sample) => {
                        cmd.proc_samples[1] = sample;
                        cmd.cpu_usage = probe::process_cpu_usage(
                            elapsed,
                            &cmd.proc_samples[1],
                            &cmd.proc_samples[0],
                        );
                    }
                    Err(e) => {
                        debug!(sheriff_id = cmd.sheriff_id, error = %e, "process probe failed");
                        cmd.cpu_usage = 0.0;
                        cmd.proc_samples[1] = ProcessSample::default();
                    }
                }
            } else {
                cmd.cpu_usage = 0.0;
                cmd.proc_samples[1] = ProcessSample::default();
            }
            cmd.proc_samples[0] = cmd.proc_samples[1];
        }

        self.sys_samples[0] = self.sys_samples[1];
    }

    async fn broadcast_info(&self) {
        let cmds: Vec<CommandInfo> = self.supervisor.commands().map(Command::to_info).collect();
        self.publisher
            .transmit_info(self.cpu_load, &self.sys_samples[1], cmds)
            .await;
    }

    async fn shutdown_cleanup(&mut self) {
        let failures = self.supervisor.remove_all();
        for (sheriff_id, e) in failures {
            warn!(sheriff_id, error = %e, "kill failed during shutdown");
            self.publisher
                .transmit_str(sheriff_id, &format!("{e}\n"))
                .await;
        }
    }
}

/// Human-readable signal description, e.g. "Terminated" for SIGTERM.
fn signal_description(signum: i32) -> String {
    // SAFETY: strsignal returns a pointer into static storage (or a
    // per-thread buffer on some libcs); it is copied out immediately.
    let ptr = unsafe { libc::strsignal(signum) };
    if ptr.is_null() {
        return format!("signal {signum}");
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}
