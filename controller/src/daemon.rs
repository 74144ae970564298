use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use sprinkler_common::{
    spawn_writer, ControllerConfig, Dispatcher, Gpio, GpioBackend, SimulatedGpio, State,
    StateStore, SysfsGpio,
};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::from_env();
    let core = config.core();
    info!(
        port = config.http_port,
        data_dir = %config.data_dir.display(),
        timezone = core.timezone.name(),
        gpio = config.gpio.as_str(),
        "starting sprinkler controller"
    );

    let gpio = open_gpio(&config)?;
    let store = StateStore::new(config.state_path());
    let state = match store.load_state(gpio.clone(), &core).await {
        Ok(state) => state,
        Err(err) => {
            warn!(path = %store.path().display(), error = %err, "stored state rejected, starting empty");
            match store.quarantine().await {
                Ok(moved) => warn!(path = %moved.display(), "rejected state file kept for inspection"),
                Err(err) => warn!(error = %err, "failed to move rejected state file aside"),
            }
            State::new(gpio, &core)
        }
    };

    let (dispatcher, changes, dispatcher_task) = Dispatcher::spawn(state);
    let writer = spawn_writer(store.clone(), changes, config.save_debounce());

    let app = api::router(dispatcher.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let snapshot = dispatcher
        .shutdown()
        .await
        .context("dispatcher stopped before shutdown")?;
    if let Err(err) = dispatcher_task.await {
        warn!(error = %err, "dispatcher task ended abnormally");
    }
    // The dispatcher's watch sender is gone, so the writer drains and exits.
    if let Err(err) = writer.await {
        warn!(error = %err, "state writer ended abnormally");
    }
    store
        .store(&snapshot)
        .await
        .context("failed to store final state")?;

    info!("controller stopped");
    Ok(())
}

fn open_gpio(config: &ControllerConfig) -> anyhow::Result<Arc<dyn Gpio>> {
    match config.gpio {
        GpioBackend::Simulated => {
            info!("using simulated gpio");
            Ok(Arc::new(SimulatedGpio::new()))
        }
        GpioBackend::Sysfs => {
            let gpio = SysfsGpio::open(&config.gpio_root).with_context(|| {
                format!("failed to open sysfs gpio at {}", config.gpio_root.display())
            })?;
            info!(root = %config.gpio_root.display(), "using sysfs gpio");
            Ok(Arc::new(gpio))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
