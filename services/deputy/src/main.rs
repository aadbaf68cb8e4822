//! posse-deputy entry point.
//!
//! Parses the command line, sets up logging and the bus, then hands control
//! to the deputy's event loop on a current-thread runtime. All state lives
//! on the loop thread; the only concurrency is the OS running the children.

use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::info;

use posse_deputy::{logging, Deputy, DeputyConfig};

#[derive(Debug, Parser)]
#[command(name = "posse-deputy", about = "Per-host process-supervision deputy")]
struct Cli {
    /// Mirror printf output to this deputy's stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Deputy name; defaults to the system hostname.
    #[arg(short, long, value_name = "NAME")]
    name: Option<String>,

    /// Redirect stdout/stderr to PATH (append, create).
    #[arg(short, long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Bus transport URL, passed opaquely to the bus layer.
    #[arg(short = 'u', long = "lcmurl", value_name = "URL", default_value = "mem://posse")]
    bus_url: String,
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            exit(0);
        }
        Err(e) => {
            eprint!("{e}");
            exit(1);
        }
    };

    // Redirect before the first log line so everything lands in the file.
    if let Some(path) = &cli.log {
        logging::redirect_output(path)?;
    }
    logging::init();

    let host = DeputyConfig::resolve_host(cli.name)?;
    let config = DeputyConfig {
        host,
        verbose: cli.verbose,
        bus_url: cli.bus_url,
        log_path: cli.log,
        ..DeputyConfig::default()
    };

    info!(host = %config.host, bus_url = %config.bus_url, "starting posse deputy");

    // A bad transport is fatal before the loop starts.
    let bus = posse_bus::connect(&config.bus_url).map_err(posse_deputy::DeputyError::Bus)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        // The binary stops via signals; the watch channel is the embedding
        // hook and never fires here.
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Deputy::new(config, bus).run(shutdown_rx).await
    })?;

    Ok(())
}
