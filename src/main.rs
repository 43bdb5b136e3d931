mod config;
mod db;
mod envelope;
mod hub;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::hub::sweeper::spawn_sweeper;
use crate::services::auth::TokenMaker;
use crate::services::store::PgStore;

/// Cancel `cancel` on Ctrl+C or SIGTERM.
fn setup_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
            () = terminate => tracing::info!("received SIGTERM, shutting down"),
        }

        cancel.cancel();
    });
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env().expect("invalid configuration");

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");
    let tokens = TokenMaker::new(&config.jwt_secret).expect("invalid JWT_SECRET");

    let state = state::AppState::new(Arc::new(PgStore::new(pool)), tokens);

    let cancel = CancellationToken::new();
    setup_shutdown_signal(cancel.clone());

    let sweeper = spawn_sweeper(state.hub.clone(), config.sweeper, cancel.child_token());

    let hub = state.hub.clone();
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "guess-who room server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            // Open sockets would otherwise hold the drain forever.
            hub.close_all();
            tracing::info!("closed all room connections");
        })
        .await
        .expect("server failed");

    let _ = sweeper.await;
    tracing::info!("server stopped");
}
