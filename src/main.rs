use std::sync::Arc;

use anyhow::Context;
use groupchat::{
    config::Config,
    db::Store,
    ingress::{self, EventSource, SqliteEventLog},
    notify::WebhookNotifier,
    reconcile::Pipeline,
    rooms::RoomRegistry,
    telemetry,
    upstream::HttpUpstream,
    AppState,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    telemetry::init();

    let store = Store::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let shutdown = CancellationToken::new();

    let upstream = Arc::new(HttpUpstream::new(
        &config.group_service_url,
        &config.user_service_url,
        config.upstream_timeout,
    )?);
    let notifier = Arc::new(WebhookNotifier::new(&config.notify_webhook_url, config.webhook_timeout)?);
    let events = SqliteEventLog::new(&store, config.ingress.lease);
    let source: Arc<dyn EventSource> = Arc::new(events.clone());

    let (pipeline, workers) = Pipeline::spawn(
        store.clone(),
        upstream,
        source.clone(),
        &config.pipeline,
        shutdown.child_token(),
    );
    let consumer = tokio::spawn(ingress::consume(
        source,
        pipeline,
        config.ingress.poll_interval,
        shutdown.child_token(),
    ));

    let rooms = RoomRegistry::new(config.outbound_buffer, shutdown.child_token());
    let app_state = AppState {
        store,
        rooms: rooms.clone(),
        notifier,
        events,
    };
    let app = groupchat::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            rooms.shutdown();
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(err) = consumer.await {
        tracing::error!(error = %err, "event consumer panicked");
    }
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::error!(error = %err, "worker panicked");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
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
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
