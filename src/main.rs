use std::sync::Arc;

use movies_mcp::{
    build_app,
    config::{Config, Transport},
    domain::{self, catalog::InMemoryCatalog},
    logging,
    mcp::{dispatcher::Dispatcher, registry::Registry},
    session::SessionManager,
    stdio, AppState,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve());
    // A blocking stdin read never returns on its own, so the runtime must not
    // wait for its worker thread.
    runtime.shutdown_background();
    result
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {

    let config = Config::from_env()?;

    let registry = Registry::new();
    domain::register(&registry, Arc::new(InMemoryCatalog::new()))?;
    registry.close();
    info!(handlers = registry.len(), "registry frozen");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        config.dispatch_options(domain::INSTRUCTIONS),
    ));

    let shutdown = CancellationToken::new();
    match config.transport {
        Transport::Stdio => {
            info!("server starting on stdio");
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                trigger.cancel();
            });
            stdio::serve_stdio(dispatcher, config.shutdown_grace, shutdown).await?;
        }
        Transport::Http => {
            let sessions = SessionManager::new(dispatcher, config.session_options());
            let sweeper = sessions.spawn_sweeper(config.session_sweep_interval, shutdown.clone());
            let bind_socket = config.bind_socket()?;
            let listener = tokio::net::TcpListener::bind(bind_socket).await?;

            info!(
                bind_addr = %config.bind_addr,
                bind_port = config.bind_port,
                "server starting"
            );

            let app = build_app(AppState::new(Arc::clone(&sessions)));
            let grace = config.shutdown_grace;

            // The listener closes on the signal; draining the sessions then
            // ends their streams so the open connections can finish.
            let trigger = shutdown.clone();
            let draining = Arc::clone(&sessions);
            let drain = tokio::spawn(async move {
                shutdown_signal().await;
                trigger.cancel();
                draining.shutdown(grace).await;
            });

            let stop_accepting = shutdown.clone();
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
                .await?;

            let _ = drain.await;
            let _ = sweeper.await;
        }
    }

    info!("server stopped");
    Ok(())
}
