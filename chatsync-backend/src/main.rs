//! `ChatSync` backend -- in-memory reference server.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin chatsync-backend
//!
//! # Run on custom address
//! cargo run --bin chatsync-backend -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! CHATSYNC_BACKEND_ADDR=127.0.0.1:8080 cargo run --bin chatsync-backend
//! ```

use std::sync::Arc;

use chatsync_backend::config::{BackendCliArgs, BackendConfig};
use chatsync_backend::server::{self, BackendState};
use chatsync_backend::store::ConversationStore;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = BackendCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match BackendConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if config.tokens.is_none() {
        tracing::warn!("no [tokens] table configured; any non-empty token is accepted");
    }
    tracing::info!(addr = %config.bind_addr, "starting chatsync backend");

    let store = ConversationStore::with_history_limit(config.history_limit);
    let state = Arc::new(BackendState::with_config(
        config.max_payload_size,
        store,
        config.tokens,
    ));

    match server::start_server_with_state(&config.bind_addr.to_string(), state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "backend listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "backend server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start backend");
            std::process::exit(1);
        }
    }
}
