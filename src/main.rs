use std::sync::Arc;

use tracing::info;

use dmtriage::config::Config;
use dmtriage::db::TriageDb;
use dmtriage::dispatch::{self, classify_channel};
use dmtriage::error::TriageError;
use dmtriage::http;
use dmtriage::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dmtriage=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = TriageDb::open(&config.database_path)?;

    let (classify_tx, classify_rx) = classify_channel();
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, db, classify_tx)?);

    tokio::spawn(dispatch::run_classify_worker(state.clone(), classify_rx));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| TriageError::Config(format!("binding {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "dmtriage listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("dmtriage stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
