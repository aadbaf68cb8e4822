//! Tracing setup and log-file redirection.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::DeputyError;

/// Initialize tracing: env-filtered compact output on stderr.
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Redirect this process's stdout and stderr onto a log file.
///
/// Opens `path` append/create and dup2s it over fds 1 and 2, so both the
/// deputy's own diagnostics and the verbose printf mirror land in the file.
/// Rust's standard streams flush per line, which keeps the file tailable.
pub fn redirect_output(path: &Path) -> Result<(), DeputyError> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| DeputyError::Fatal(format!("couldn't open logfile {}: {e}", path.display())))?;

    let fd = file.as_raw_fd();
    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: plain fd duplication; both fds are owned by this process.
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(DeputyError::Fatal(format!(
                "couldn't redirect fd {target}: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    // `file` drops here; the duplicated descriptors keep the file open.
    Ok(())
}
