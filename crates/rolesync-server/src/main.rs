//! # rolesync-server
//!
//! Keeps people's Telegram group memberships in line with their assigned
//! role.
//!
//! This binary provides:
//! - **REST API** (axum) for registration, decisions, role changes,
//!   termination, per-person status and the audit log
//! - **Telegram Bot API adapter** the engine drives to admit and evict
//! - **Background sweeper** that retries unfinished work and prunes old
//!   audit records

mod api;
mod config;
mod error;
mod telegram;

use std::sync::Arc;

use anyhow::Context;
use rolesync_engine::SyncEngine;
use rolesync_store::Database;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::telegram::TelegramChatApi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,rolesync_server=debug,rolesync_engine=debug")
            }),
        )
        .init();

    info!("Starting rolesync v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set, /api/* will refuse every request");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let database = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?database.path(), "Database ready");

    let token = config
        .bot_token
        .clone()
        .context("BOT_TOKEN must be set")?;
    let chat_api = TelegramChatApi::new(
        &config.chat_api_base_url,
        &token,
        config.call_timeout(),
        config.invite_ttl(),
    )?;

    let engine = SyncEngine::new(
        Arc::new(Mutex::new(database)),
        Arc::new(chat_api),
        config.engine_config(),
    );

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Agent rights are cached per chat; refresh them once at startup.
    let refresher = engine.clone();
    tokio::spawn(async move {
        match refresher.refresh_chat_rights().await {
            Ok(chats) => {
                let missing = chats
                    .iter()
                    .filter(|c| !c.rights.is_some_and(|r| r.is_admin()))
                    .count();
                info!(chats = chats.len(), missing, "Agent rights refreshed");
            }
            Err(e) => tracing::warn!(error = %e, "Agent rights refresh failed"),
        }
    });

    // Periodic sweep: retry unfinished passes, prune the audit log.
    let sweeper = engine.clone();
    let every = config.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sweep().await {
                tracing::warn!(error = %e, "Sweep failed");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState {
        engine,
        config: Arc::new(config),
    };

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
