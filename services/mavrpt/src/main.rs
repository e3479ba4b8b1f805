//! MAVLink Repeater (mavrpt)
//!
//! Serial <-> UDP telemetry relay. The name the binary is invoked under
//! (`mavrpt`, `mavrptclient`, `mavrptserver`) selects the configuration
//! profile and the default network mode.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use common::{init_tracing, spawn_signal_watcher, Lifecycle, LogSink};
use errors::{BridgeError, BridgeResult, EXIT_OK};
use mavrpt::bootstrap::{self, Args};
use mavrpt::{BridgeConfig, ProgramFunction};

fn main() {
    let args = Args::parse();
    let argv0 = std::env::args().next().unwrap_or_else(|| "mavrpt".to_string());
    let function = ProgramFunction::from_program_name(&argv0);

    let code = match run(args, function) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            report(&e);
            e.exit_code()
        },
    };
    std::process::exit(code);
}

fn run(args: Args, function: ProgramFunction) -> BridgeResult<()> {
    let mut config = BridgeConfig::load(function, args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    if args.validate {
        println!("Configuration for '{}':", function.profile());
        println!("{}", bootstrap::render_config(&config)?);
        return Ok(());
    }

    let sink = Arc::new(LogSink::new(function.profile()));
    bootstrap::configure_logging(&sink, &config.logging);
    if let Err(e) = init_tracing(Arc::clone(&sink)) {
        eprintln!("{}: cannot install log subscriber: {}", function.profile(), e);
    }

    if config.daemon {
        bootstrap::daemonize()?;
        if config.startup_delay_secs > 0 {
            info!("Waiting {}s before opening devices", config.startup_delay_secs);
            std::thread::sleep(Duration::from_secs(config.startup_delay_secs));
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(async {
        let lifecycle = Arc::new(Lifecycle::new());
        let watcher = spawn_signal_watcher(Arc::clone(&lifecycle));

        let result = mavrpt::start(&config, Arc::clone(&lifecycle)).await;

        lifecycle.request_stop();
        let _ = watcher.await;
        result
    });

    match &result {
        Ok(stats) => info!(
            "Shutdown complete after {} iterations ({} reconfigure requests)",
            stats.iterations, stats.reconfigure_requests
        ),
        Err(e) if e.is_setup_failure() => error!("Setup failed: {}", e),
        Err(_) => {},
    }
    sink.close();

    result.map(|_| ())
}

/// Configuration errors surface before logging is set up, so always tell stderr
fn report(e: &BridgeError) {
    eprintln!("mavrpt: {}", e);
}
