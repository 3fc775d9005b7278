//! Veil relay server entry point.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use veil_relay::cleanup;
use veil_relay::config::Config;
use veil_relay::relay::{self, ConnectionLog, RelayState};
use veil_relay::storage::Storage;

#[tokio::main]
async fn main() {
    if dotenvy::dotenv().is_err() {
        eprintln!("no .env file found, relying on environment variables");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    let db = Storage::open(Path::new("relay.db")).expect("failed to open database");
    let conn_log =
        ConnectionLog::open(Path::new("connections.log")).expect("failed to open connection log");

    let state = Arc::new(RelayState::new(db, config, conn_log));
    cleanup::spawn_monthly(state.clone());

    let app = relay::router(state);
    let addr = "0.0.0.0:9000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    tracing::info!("veil relay listening on {addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
