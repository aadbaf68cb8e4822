//! Deputy runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::DeputyError;

/// Settings the deputy runs with, resolved from the command line.
#[derive(Debug, Clone)]
pub struct DeputyConfig {
    /// Deputy identity; orders are obeyed only when addressed to this name.
    pub host: String,

    /// Mirror printf traffic to the deputy's own stderr.
    pub verbose: bool,

    /// Transport URL, passed opaquely to the bus layer.
    pub bus_url: String,

    /// When set, stdout/stderr are redirected here (append, line-buffered).
    pub log_path: Option<PathBuf>,

    /// Cadence of resource sampling + info broadcasts.
    pub info_interval: Duration,

    /// Cadence of introspection MARK summaries.
    pub mark_interval: Duration,
}

impl Default for DeputyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            verbose: false,
            bus_url: "mem://posse".to_string(),
            log_path: None,
            info_interval: Duration::from_secs(1),
            mark_interval: Duration::from_secs(120),
        }
    }
}

impl DeputyConfig {
    /// Fill in the host name from the system hostname when no override was
    /// given on the command line.
    pub fn resolve_host(name_override: Option<String>) -> Result<String, DeputyError> {
        match name_override {
            Some(name) => Ok(name),
            None => nix::unistd::gethostname()
                .map_err(|e| DeputyError::Fatal(format!("cannot read hostname: {e}")))?
                .into_string()
                .map_err(|_| DeputyError::Fatal("hostname is not valid UTF-8".to_string())),
        }
    }
}
