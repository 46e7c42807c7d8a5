//! ==============================================================================
//! main.rs - sqm host daemon entry point
//! ==============================================================================
//!
//! purpose:
//!     unattended logger for a Sky Quality Meter photometer. it finds the
//!     device, samples it all night, and keeps monthly, daily and "current"
//!     data files up to date.
//!
//! responsibilities:
//!     - parse the command line and load sqm.toml
//!     - initialize tracing
//!     - create the output directories
//!     - supervise the acquisition loop: whatever takes it down (an error
//!       or a panic), log it, wait, rebuild everything and start again
//!
//! relationships:
//!     - uses: transport.rs / network.rs / serial.rs (device channel)
//!     - uses: protocol.rs (session), header.rs (file header)
//!     - uses: store.rs, sinks.rs, report.rs (outputs)
//!     - uses: scheduler.rs (the loop), ephemeris.rs (day/night gate)
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                 tokio runtime (current thread)               │
//!     │   ┌───────────────────────┐        ┌──────────────────────┐  │
//!     │   │ spawn_blocking:       │        │ ctrl_c               │  │
//!     │   │   supervisor loop     │        │   -> process exit    │  │
//!     │   └───────────┬───────────┘        └──────────────────────┘  │
//!     └───────────────┼──────────────────────────────────────────────┘
//!                     ▼
//!             ┌───────────────┐    ┌─────────┐    ┌───────────┐
//!             │  scheduler    │──▶ │ sampler │──▶ │ protocol  │──▶ device
//!             └───────┬───────┘    └─────────┘    └───────────┘
//!                     ▼
//!         store (monthly / daily / current), sqlite sink, nightly report
//!
//! ==============================================================================

mod clock;
mod config;
mod datafile;
mod ephemeris;
mod error;
mod header;
mod network;
mod protocol;
mod reading;
mod report;
mod sampler;
mod scheduler;
mod serial;
mod sinks;
mod store;
mod transport;

use std::convert::Infallible;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::config::DaemonConfig;
use crate::ephemeris::SolarEphemeris;
use crate::protocol::DeviceSession;
use crate::reading::LocalTime;
use crate::report::NightlySummary;
use crate::scheduler::Scheduler;
use crate::sinks::SqliteSink;
use crate::store::CacheStore;

#[derive(Parser, Debug)]
#[command(name = "sqm-host", version, about = "Sky Quality Meter logging daemon")]
struct Args {
    /// Path to sqm.toml (defaults to config/sqm.toml or ../config/sqm.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // startup banner
    println!("===========================================================");
    println!("  SQM Host - Sky Quality Meter logging daemon");
    println!("===========================================================");

    // step 1: load configuration
    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::load_or_default(),
    };
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the config file)
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // step 3: output directories
    config.create_directories()?;

    // step 4: the acquisition loop never returns; Ctrl-C ends the process
    let supervisor = tokio::task::spawn_blocking(move || supervise(&config));
    tokio::select! {
        result = supervisor => {
            result.context("supervisor thread ended")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("[SHUTDOWN] Ctrl-C received, exiting");
            // the blocking loop cannot be cancelled; leave without waiting on it
            std::process::exit(0);
        }
    }
    Ok(())
}

// ==============================================================================
// supervisor
// ==============================================================================

/// Restart the daemon forever. In-flight buffer and session are lost on a
/// restart; everything already flushed is safe.
fn supervise(config: &DaemonConfig) {
    let delay = config.recovery.restart_delay();
    keep_running(
        || run_daemon(config),
        |_| {
            warn!("[SUPERVISOR] Restarting in {}s", delay.as_secs());
            std::thread::sleep(delay);
            ControlFlow::Continue(())
        },
    );
}

/// Run `daemon` again after every error or panic. `pause` is called with
/// the restart count before each restart and may stop the loop.
fn keep_running<D, P>(mut daemon: D, mut pause: P) -> u64
where
    D: FnMut() -> Result<Infallible>,
    P: FnMut(u64) -> ControlFlow<()>,
{
    let mut restarts = 0;
    loop {
        match panic::catch_unwind(AssertUnwindSafe(|| daemon())) {
            Ok(Ok(never)) => match never {},
            Ok(Err(e)) => error!("[SUPERVISOR] Daemon stopped: {:#}", e),
            Err(_) => error!("[SUPERVISOR] Daemon panicked"),
        }
        restarts += 1;
        if pause(restarts).is_break() {
            return restarts;
        }
    }
}

/// Build every component from the configuration and run the scheduler.
fn run_daemon(config: &DaemonConfig) -> Result<Infallible> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let local_time = LocalTime::from_config(&config.time)?;

    info!("[STARTUP] Looking for {}", config.device.kind.model_name());
    let transport = transport::for_device(&config.device);
    let session = DeviceSession::open(transport, &config.device, clock.clone())
        .context("could not open the photometer")?;
    println!("[STARTUP] ✓ Photometer ready at {}", session.address());

    let header = header::render(config, &local_time, session.identification(), session.readouts());
    let store = CacheStore::new(header, config.sampling.cache_measures);
    let report = NightlySummary::new(config, local_time);
    let ephemeris = SolarEphemeris::new(&config.site);

    let mut scheduler = Scheduler::new(
        config,
        session,
        store,
        Box::new(ephemeris),
        Box::new(report),
        local_time,
        clock,
    );

    if config.database.enabled {
        match SqliteSink::new(&config.database) {
            Ok(sink) => scheduler = scheduler.with_sink(Box::new(sink)),
            Err(e) => warn!("[DB] Sink disabled: {:#}", e),
        }
    }

    println!("────────────────────────────────────────────────────────────");
    scheduler.run()
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;

    #[test]
    fn supervisor_restarts_after_errors_and_panics() {
        let mut runs = 0;
        let restarts = keep_running(
            || {
                runs += 1;
                if runs % 2 == 0 {
                    panic!("sampler blew up");
                }
                bail!("device lost")
            },
            |restarts| {
                if restarts < 4 {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            },
        );
        assert_eq!(restarts, 4);
        assert_eq!(runs, 4);
    }
}
