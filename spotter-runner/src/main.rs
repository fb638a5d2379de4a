// Spotter - camera people detection service

use anyhow::Context;
use clap::Parser;
use spotter_bus::MqttBus;
use spotter_core::RunState;
use spotter_runner::logging::init_logging;
use spotter_runner::setup::{build_source, build_timing_log, setup_stages};
use spotter_runner::{Cli, ExitReason, RunController};
use std::sync::atomic::Ordering;
use tokio::signal;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config().context("Invalid configuration")?;
    config
        .ensure_directories()
        .context("Cannot create output directories")?;

    let log_file = init_logging(config.app.dev_mode, &config.app.log_level, &config.paths.log_dir)?;
    info!("---------------- Spotter started ----------------");
    if let Some(path) = log_file {
        debug!("Logging to {:?}", path);
    }

    let run_state = RunState::new();
    let bus = MqttBus::connect(&config.mqtt, &config.app.location, run_state.clone())
        .context("Unable to connect to MQTT broker")?;

    let mut timing = build_timing_log(&config)?;
    let stages = setup_stages(&config, &mut timing)
        .with_context(|| format!("Cannot set up the {} pipeline", config.app.pipeline.as_str()))?;
    let source = build_source(&config)?;

    let mut controller = RunController::new(stages, source, Box::new(bus), timing, run_state)
        .with_capture_interval(config.capture_interval());

    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown.store(true, Ordering::Release);
    });

    // blocking pipeline work stays off the async workers; dropping the
    // controller disconnects the bus and releases the accelerator
    let reason = tokio::task::spawn_blocking(move || {
        let reason = controller.run();
        info!("{} cycle(s) processed", controller.cycles());
        drop(controller);
        reason
    })
    .await?;

    match reason {
        ExitReason::Shutdown => info!("Shutdown requested"),
        ExitReason::InputExhausted => info!("Static input exhausted"),
    }
    info!("---------------- Spotter ended ----------------");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
