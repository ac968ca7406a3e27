//! Hosting binary: parses a config file, binds every configured listener, and drives the reactor
//! until SIGINT/SIGTERM requests a graceful (then, past a timeout, barbaric) shutdown.

use clap::Parser;
use pt_proxy::{ProxyConfig, Reactor, Runtime};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pt-proxy", about = "Connection-forwarding dataplane for a pluggable-transport proxy")]
struct Args {
    /// Path to a TOML configuration file describing the listeners to bind.
    #[arg(short, long)]
    config: std::path::PathBuf,

    /// Overrides the configured log level (e.g. "debug", "pt_proxy=trace").
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds to wait for connections to drain after a graceful shutdown request before
    /// escalating to a barbaric one that closes them immediately.
    #[arg(long, default_value_t = 30)]
    barbaric_shutdown_timeout: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ProxyConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let log_level = args.log_level.clone().unwrap_or_else(|| config.observability.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(config, args.barbaric_shutdown_timeout) {
        tracing::error!(error = %e, "fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(config: ProxyConfig, barbaric_shutdown_timeout: u64) -> pt_proxy::Result<()> {
    let mut reactor = Reactor::new()?;
    let mut runtime = Runtime::new(&reactor)?;

    for listener_config in &config.listeners {
        runtime.listener_new(&mut reactor, listener_config)?;
    }
    tracing::info!(listeners = runtime.listener_count(), "proxy started");

    spawn_signal_thread(runtime.shutdown_request(), barbaric_shutdown_timeout);

    runtime.run(&mut reactor)
}

/// Own thread, blocking on `signal_hook::iterator::Signals`: the first SIGINT/SIGTERM requests a
/// graceful shutdown, a second escalates immediately, and otherwise a graceful request that
/// hasn't drained within `barbaric_shutdown_timeout` seconds is escalated automatically.
fn spawn_signal_thread(shutdown_request: std::sync::Arc<pt_proxy::runtime::ShutdownRequest>, barbaric_shutdown_timeout: u64) {
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handlers; shutdown must be forced externally");
            return;
        }
    };
    std::thread::spawn(move || {
        let mut graceful_requested_at = None;
        for _ in signals.forever() {
            match graceful_requested_at {
                None => {
                    tracing::info!("shutdown signal received; draining connections");
                    shutdown_request.request(false);
                    graceful_requested_at = Some(std::time::Instant::now());
                    let shutdown_request = std::sync::Arc::clone(&shutdown_request);
                    let timeout = Duration::from_secs(barbaric_shutdown_timeout);
                    std::thread::spawn(move || {
                        std::thread::sleep(timeout);
                        tracing::warn!("graceful shutdown timed out; forcing connections closed");
                        shutdown_request.request(true);
                    });
                }
                Some(_) => {
                    tracing::warn!("second shutdown signal received; forcing connections closed");
                    shutdown_request.request(true);
                }
            }
        }
    });
}
