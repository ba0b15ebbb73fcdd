use std::sync::Arc;

use roomcast::broker::Hub;
use roomcast::config::load_config;
use roomcast::persistence::open_store;
use roomcast::transport::websocket::start_websocket_server;
use roomcast::utils::logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.server.log_level);

    let store = match open_store(&config.store) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open membership store: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(backend = ?config.store.backend, "membership store ready");

    let hub = Arc::new(Hub::new(store, &config.hub));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    tokio::select! {
        res = start_websocket_server(&addr, hub.clone(), config.hub.clone()) => {
            if let Err(e) = res {
                tracing::error!("WebSocket server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            if let Err(e) = hub.log_state().await {
                tracing::warn!("Failed to dump hub state: {e}");
            }
        }
    }
}
