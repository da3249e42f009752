//! # trefla-server
//!
//! Card verification and chat ownership server for Trefla.
//!
//! This binary provides:
//! - **Card ownership engine**: admin verify / reject / unverify and
//!   holder-to-holder card transfers, with card chats relinked to the
//!   current verified holder
//! - **REST API** (axum) for users and the back office
//! - **Real-time channel** over WebSocket for notifications and chat list
//!   updates
//! - **Device pushes** through an FCM-style HTTP gateway

mod api;
mod config;
mod effects;
mod engine;
mod error;
mod locks;
mod push;
mod relink;
mod sessions;
mod ws;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use trefla_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::engine::CardOwnership;
use crate::push::{HttpPush, LogPush, PushSender};
use crate::sessions::SessionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,trefla_server=debug")),
        )
        .init();

    info!("Starting Trefla server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        database = %config.database_path.display(),
        admin_enabled = config.admin_token.is_some(),
        push_enabled = config.push_enabled(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    let push: Arc<dyn PushSender> = match &config.push_endpoint {
        Some(endpoint) => Arc::new(HttpPush::new(
            endpoint.clone(),
            config.push_server_key.clone(),
            config.push_timeout,
        )?),
        None => {
            warn!("PUSH_ENDPOINT not set, device pushes will only be logged");
            Arc::new(LogPush)
        }
    };

    let sessions = SessionRegistry::new(config.session_buffer);
    let engine = CardOwnership::new(Arc::new(Mutex::new(db)), sessions, push);

    let http_addr = config.http_addr;
    let app_state = AppState {
        engine: engine.clone(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Idle card lock cleanup (every 10 minutes)
    let locks = engine.locks().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            let purged = locks.purge_idle().await;
            if purged > 0 {
                let remaining = locks.len().await;
                debug!(purged, remaining, "Purged idle card locks");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
