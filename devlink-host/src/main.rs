// devlink host: accepts device streams, runs discovery, dispatches device events.

use std::sync::Arc;

use devlink_core::{DeviceRegistry, Discovery};
use devlink_host::{config, telemetry, transport};
use devlink_host::{ConnectionSettings, Dispatcher, Link, LoggingDeviceHost, Senders};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("devlink-host {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    telemetry::init(&cfg.log_filter)?;

    let registry = DeviceRegistry::from_declared(cfg.declared_records());
    info!(declared = registry.len(), "loaded declared devices");
    let discovery = Arc::new(Mutex::new(Discovery::with_registry(registry)));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let senders = Senders::default();
    let link = Link {
        discovery: discovery.clone(),
        events: events_tx,
        senders: senders.clone(),
        settings: Arc::new(ConnectionSettings {
            read_buffer_size: cfg.read_buffer_size,
            delimiter: cfg.delimiter.clone(),
            max_frame_len: cfg.max_frame_len,
        }),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let dispatcher = Dispatcher::new(events_rx, discovery.clone());
        tokio::spawn(dispatcher.run(LoggingDeviceHost::default()));
        let listener = tokio::spawn(transport::run_listener(cfg.listen_addr, link));

        tokio::select! {
            res = listener => res??,
            res = shutdown_signal() => res?,
        }

        info!(connections = senders.len().await, "shutting down");
        senders.close_all().await;
        let stats = discovery.lock().await.stats();
        info!(?stats, "discovery totals");
        Ok::<_, anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
