//! Worker entry point.
//!
//! Launched by the host as `outpost-worker <segment_name> [size_bytes]`.
//! Exits 0 on a clean shutdown, 1 on any usage or initialization failure.
//! Diagnostics go to stderr, which the host pipes into its own log stream.

use outpost::worker::{Worker, WorkerConfig};
use std::env;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(segment_name) = args.next() else {
        eprintln!("usage: outpost-worker <segment_name> [size_bytes]");
        return ExitCode::FAILURE;
    };

    let mut config = WorkerConfig::new(&segment_name);
    if let Some(raw) = args.next() {
        match raw.parse::<usize>() {
            Ok(size) => config = config.with_segment_size(size),
            Err(_) => {
                eprintln!("invalid segment size: {raw}");
                return ExitCode::FAILURE;
            }
        }
    }
    if args.next().is_some() {
        eprintln!("usage: outpost-worker <segment_name> [size_bytes]");
        return ExitCode::FAILURE;
    }

    tracing::info!(segment = %segment_name, size = config.segment_size, "worker starting");

    let mut worker = match Worker::attach(config) {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!("worker initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = worker.install_signal_flags() {
        tracing::error!("signal handler setup failed: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = worker.spawn_orphan_watchdog() {
        tracing::error!("orphan watchdog setup failed: {e}");
        return ExitCode::FAILURE;
    }

    match worker.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker loop failed: {e}");
            ExitCode::FAILURE
        }
    }
}
