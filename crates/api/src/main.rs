use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use cloudtasker_api::app::{build_app, services};
use cloudtasker_events::MessageBus;
use cloudtasker_infra::jobs::{TaskWorker, TaskWorkerConfig, default_handler};
use cloudtasker_infra::{AppConfig, Relay, TaskService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cloudtasker_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let store = services::connect_store(&config)
        .await
        .context("failed to open store")?;
    let bus = services::connect_bus(&config).context("failed to open message bus")?;

    let relay = Relay::new(store.clone(), bus.clone(), config.relay.clone()).spawn();

    let worker = if config.run_embedded_worker {
        let service = Arc::new(TaskService::new(store.clone()));
        let worker = TaskWorker::new(
            service,
            TaskWorkerConfig::default().with_name("embedded-worker"),
            default_handler,
        );
        Some(worker.spawn(bus.subscribe()))
    } else {
        None
    };

    let app_services = Arc::new(services::AppServices::new(store, config.request_timeout));
    let app = build_app(app_services);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining background tasks");
    relay.shutdown().await;
    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
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

    tracing::info!("shutdown signal received");
}
