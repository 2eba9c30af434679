//! # parley-server
//!
//! Real-time chat backend:
//! - **WebSocket gateway** for the persistent bidirectional channel
//!   (message fan-out, presence, typing, read receipts)
//! - **Session registry** mapping authenticated identities to their live
//!   connections, with presence derived from registry occupancy
//! - **REST API** (axum) for history, search, groups, media, and
//!   notifications
//! - **SQLite store** for users, conversations, groups, messages, media
//!   and notifications
//! - **Per-IP rate limiting** on the HTTP surface

mod api;
mod auth;
mod config;
mod error;
mod gateway;
mod media_store;
mod notify;
mod payload;
mod rate_limit;
mod registry;
mod router;
mod state;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::config::Config;
use crate::media_store::MediaStore;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = Config::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };

    // no session survives a restart; the durable mirror starts clean
    let stale = db.clear_sessions()?;
    if stale > 0 {
        info!(stale, "cleared stale session mirror rows");
    }

    let media_store = MediaStore::new(
        config.media_storage_path.clone(),
        config.max_media_size,
    )
    .await?;

    let http_addr = config.http_addr;
    let state = AppState::new(db, media_store, config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
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
