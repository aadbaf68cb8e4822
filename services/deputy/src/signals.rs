//! Signal bridge: async OS signals delivered as typed loop events.
//!
//! The handled set is fixed: SIGCHLD means "a child exited, go reap";
//! SIGINT/SIGHUP/SIGQUIT/SIGTERM all mean "terminate gracefully". The
//! runtime's signal driver already coalesces repeats between reads, so one
//! event may stand for several deliveries; ordering across distinct signals
//! is not guaranteed.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

/// A signal, decoded into what the loop should do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// One or more children changed state; run the reap path.
    ChildExited,
    /// A termination signal arrived; stop everything and exit the loop.
    Terminate(&'static str),
}

/// Listens on the five deputy signals and hands the loop typed events.
pub struct SignalBridge {
    sigchld: Signal,
    sigint: Signal,
    sighup: Signal,
    sigquit: Signal,
    sigterm: Signal,
}

impl SignalBridge {
    /// Install listeners for all five signals.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            sigquit: signal(SignalKind::quit())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal event.
    ///
    /// Cancellation-safe; suitable as a `select!` branch.
    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.sigchld.recv() => SignalEvent::ChildExited,
            _ = self.sigint.recv() => SignalEvent::Terminate("SIGINT"),
            _ = self.sighup.recv() => SignalEvent::Terminate("SIGHUP"),
            _ = self.sigquit.recv() => SignalEvent::Terminate("SIGQUIT"),
            _ = self.sigterm.recv() => SignalEvent::Terminate("SIGTERM"),
        }
    }
}
