//! ==============================================================================
//! main.rs - gpu telemetry host entry point
//! ==============================================================================
//!
//! responsibilities:
//!     - load configuration and start logging
//!     - enumerate devices once (fatal if the telemetry library is unusable)
//!     - run the fixed-interval sample-then-broadcast loop
//!     - serve the dashboard, json api and websocket push channel
//!     - stop both on ctrl-c
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                      rust host (this file)                  │
//!     │  ┌──────────────────┐              ┌──────────────────────┐ │
//!     │  │ broadcast loop   │              │ web server           │ │
//!     │  │ (1s cycle)       │              │ (port 3000, /ws)     │ │
//!     │  └───┬─────────┬────┘              └────┬────────────┬────┘ │
//!     │      │         │   subscriber registry  │            │      │
//!     │      │         └──────────┬─────────────┘            │      │
//!     │  ┌───┴─────┐              │                  ┌───────┴────┐ │
//!     │  │ sampler │              │                  │  registry  │ │
//!     │  └───┬─────┘              │                  │  (roster)  │ │
//!     └──────┼────────────────────┼──────────────────┴────────────┴─┘
//!            │ hal.rs             │ mpsc per connection
//!            ▼                    ▼
//!      ┌───────────┐        ┌───────────┐
//!      │ nvml/mock │        │ browsers  │
//!      └───────────┘        └───────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use gpu_telemetry_host::config::HostConfig;
use gpu_telemetry_host::hal;
use gpu_telemetry_host::history::History;
use gpu_telemetry_host::logging;
use gpu_telemetry_host::registry::DeviceRegistry;
use gpu_telemetry_host::sampler::Sampler;
use gpu_telemetry_host::scheduler::BroadcastScheduler;
use gpu_telemetry_host::server::{self, AppState};
use gpu_telemetry_host::subscribers::SubscriberRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    println!("===========================================================");
    println!("  GPU Telemetry Host");
    println!("===========================================================");

    // step 1: load configuration
    let config = HostConfig::load_or_default();
    logging::init(&config.logging.level)?;
    config.print_summary();

    // step 2: enumerate devices
    let source = hal::from_config(&config.backend)?;
    let registry = match DeviceRegistry::enumerate(source.as_ref()) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            let e = anyhow::Error::new(e).context("device enumeration failed");
            error!("Fatal: {:#}", e);
            return Err(e);
        }
    };
    info!(devices = registry.len(), "device registry ready");

    // step 3: wire the engine
    let subscribers = Arc::new(SubscriberRegistry::new());
    let history = Arc::new(History::new(config.history.capacity));
    let scheduler = Arc::new(
        BroadcastScheduler::new(
            Arc::clone(&registry),
            Arc::new(Sampler::new(source)),
            Arc::clone(&subscribers),
            Arc::clone(&history),
            config.polling.interval(),
        )
        .with_device_logging(config.logging.show_device_data),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => {
                // without a signal handler the host runs until killed
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    // step 4: start the web server in background
    let state = AppState {
        registry,
        subscribers,
        history,
        scheduler: Arc::clone(&scheduler),
        queue_depth: config.subscribers.queue_depth,
    };
    let app = server::router(state, &config.server.assets_dir);
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Dashboard live at http://{}", addr);
    let web = tokio::spawn(server::run_server(listener, app, wait_for_shutdown(shutdown_rx.clone())));

    // step 5: broadcast loop until shutdown
    scheduler.run(wait_for_shutdown(shutdown_rx)).await;

    match web.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "web server error"),
        Err(e) => error!(error = %e, "web server task failed"),
    }
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
