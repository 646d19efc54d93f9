use std::{
    process,
    sync::{Arc, OnceLock},
    time::Duration,
};

use deckbridge::{
    config::Config,
    core::{
        device::{Device, DeviceManager},
        session::run_session,
    },
    logger::LoggerManager,
    print_error,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting deckbridge version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.transport);
    info!("Log level: {}", cfg.logger.level);
    info!(
        "Broker: {}:{}, base topic '{}'",
        cfg.transport.host, cfg.transport.port, cfg.transport.base_topic
    );

    let devices = DeviceManager::new().unwrap_or_else(|e| {
        error!("Failed to initialize HID: {}", e);
        process::exit(1);
    });

    let found = devices.visual_devices();
    if found.is_empty() {
        error!("No Stream Deck with key displays found");
        process::exit(1);
    }
    info!("Found {} device(s)", found.len());

    let root = CancellationToken::new();
    let mut sessions = JoinSet::new();

    for (kind, serial) in found {
        let device: Arc<dyn Device> = match devices.open(kind, &serial) {
            Ok(device) => Arc::new(device),
            Err(e) => {
                error!("Failed to open {:?} {}: {}", kind, serial, e);
                continue;
            }
        };

        let token = root.child_token();
        sessions.spawn(async move {
            let serial = device.serial_number().to_string();
            let result = run_session(cfg, device, token).await;
            (serial, result)
        });
    }

    if sessions.is_empty() {
        error!("No device session could be started");
        process::exit(1);
    }

    {
        let root = root.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            root.cancel();
        });
    }

    let total = sessions.len();
    let mut failed = 0;
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok((serial, Ok(()))) => debug!("Session {} finished", serial),
            Ok((serial, Err(e))) => {
                error!("Session {} ended with error: {}", serial, e);
                failed += 1;
            }
            Err(e) => {
                error!("Session task failed: {}", e);
                failed += 1;
            }
        }
    }

    // Let the connection kernels flush `offline` and DISCONNECT.
    tokio::time::sleep(Duration::from_millis(300)).await;

    if failed == total {
        error!("All {} device session(s) failed", total);
        process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}
