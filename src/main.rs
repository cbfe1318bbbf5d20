use std::net::SocketAddr;
use std::sync::Arc;

use horoquiz_live::config::Config;
use horoquiz_live::logging;
use horoquiz_live::state::AppState;
use horoquiz_live::store::mysql::MySqlSessionStore;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    logging::init_tracing(&config.log_level);

    let database_url = config
        .database_url
        .clone()
        .expect("DATABASE_URL is required");

    let store = MySqlSessionStore::connect(&database_url, config.room.store_deadline)
        .await
        .expect("database init failed");

    let addr = config.bind_addr();
    let state = AppState::new(config, Arc::new(store));
    let app = horoquiz_live::create_app(state);

    tracing::info!(%addr, "live session orchestrator listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind listener failed");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        tracing::error!(error = %err, "server error");
    }

    tracing::info!("HTTP server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
