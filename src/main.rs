//! ioforge CLI entry point

use anyhow::Context;
use clap::Parser;
use ioforge::config::{self, cli::Cli};
use ioforge::coordinator::topology::Topology;
use ioforge::coordinator::ExternalControls;
use ioforge::{output, Result, RunCoordinator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

/// SIGINT handler target; the coordinator polls the same flag
static STOP_REQUESTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_interrupt(_: libc::c_int) {
    if let Some(flag) = STOP_REQUESTED.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

fn install_interrupt_handler() -> Arc<AtomicBool> {
    let flag = STOP_REQUESTED
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();
    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_interrupt as libc::sighandler_t);
    }
    flag
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let spec = match &cli.profile {
        Some(path) => config::profile::load(path)
            .with_context(|| format!("failed to load profile {}", path.display()))?,
        None => cli.to_spec()?,
    };
    config::validate(&spec)?;

    let stop = install_interrupt_handler();
    let controls = ExternalControls {
        stop_signal: Some(stop),
        ..Default::default()
    };

    let topology = Topology::detect();
    let coordinator = RunCoordinator::new();
    let results = coordinator.run_with_controls(&spec, &topology, controls)?;

    let stdout = std::io::stdout();
    if cli.json {
        output::json::write_report(&mut stdout.lock(), &results, &spec)?;
    } else {
        output::text::write_report(&mut stdout.lock(), &results, &spec)?;
    }
    Ok(())
}
