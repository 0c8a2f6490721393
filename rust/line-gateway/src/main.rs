/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! LINE gateway for the DPIS6 assistant.
//!
//! Exposes:
//! - `POST /webhook`, `POST /callback` — LINE Messaging API webhook
//! - `GET  /`, `GET /ping`             — liveness, plain `OK`
//! - `GET  /health`                    — JSON health with store check
//!
//! New users are registered (name, then department); verified users get
//! their questions answered by the completion gateway.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod departments;
mod line;
mod profile;
mod registration;
mod relay;
#[cfg(test)]
mod testing;
mod webhook;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use dpisline_config::{Config, SettingsError};
use dpisline_runtime::shutdown_signal;
use tracing::{error, info, warn};

use crate::line::{LineReplyClient, ReplySender};
use crate::profile::{
    connect_options, MemoryProfileStore, PgProfileStore, ProfileStore, StoreError,
};
use crate::registration::Registration;
use crate::relay::{AiRelay, HttpCompletionClient};

pub const SERVICE_NAME: &str = "line-gateway";

/// LINE webhook bodies are small; anything near this is not from LINE.
const MAX_BODY_BYTES: usize = 1_048_576; // 1 MiB

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("profile store: {0}")]
    Store(#[from] StoreError),
    #[error("http client: {0}")]
    Client(String),
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState {
    config: Arc<Config>,
    channel_secret: String,
    registration: Registration,
    relay: AiRelay,
    replies: Arc<dyn ReplySender>,
    store: Arc<dyn ProfileStore>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    // Environment must be settled before any worker thread exists.
    dpisline_runtime::load_dotenv();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: failed to build tokio runtime: {e}");
            process::exit(1);
        }
    };
    runtime.block_on(async_main());
}

async fn async_main() {
    let config = match Config::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("fatal: failed to load config: {e}");
            process::exit(1);
        }
    };

    let _telemetry_guard = dpisline_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    info!(
        service = SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        env = %config.service.env,
        "starting"
    );

    let state = match init_state(Arc::clone(&config)).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise");
            process::exit(1);
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.service.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(addr = %addr, "listening");

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }

    info!("shutdown complete");
}

async fn init_state(config: Arc<Config>) -> Result<AppState, StartupError> {
    config.validate()?;
    let creds = config.credentials()?;
    info!(ai_base_url = %creds.ai_base_url, "credentials resolved");

    let store: Arc<dyn ProfileStore> = match config.postgres {
        Some(ref pg) => {
            let password = pg.password()?;
            let options = connect_options(pg, &password);
            Arc::new(PgProfileStore::connect(options, pg.max_connections).await?)
        }
        None => {
            warn!("no [postgres] section, profiles are kept in memory and lost on restart");
            Arc::new(MemoryProfileStore::new())
        }
    };

    let replies = LineReplyClient::new(
        &config.line.api_base,
        &creds.channel_access_token,
        config.line.timeout_seconds,
    )
    .map_err(|e| StartupError::Client(e.to_string()))?;

    let completions = HttpCompletionClient::new(&creds.ai_base_url, &creds.ai_api_key, &config.ai)
        .map_err(|e| StartupError::Client(e.to_string()))?;

    let registration = Registration::new(Arc::clone(&store), &config.registration);
    info!(
        departments = registration.matcher().catalog_size(),
        store = store.kind(),
        completion_paths = ?config.ai.completion_paths,
        "gateway ready"
    );

    Ok(AppState {
        relay: AiRelay::new(Arc::new(completions), &config.ai),
        registration,
        replies: Arc::new(replies),
        store,
        channel_secret: creds.channel_secret,
        config,
    })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook::webhook_handler))
        .route("/callback", post(webhook::webhook_handler))
        .route("/", get(webhook::ping_handler))
        .route("/ping", get(webhook::ping_handler))
        .route("/health", get(webhook::health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Security headers middleware (OWASP A05)
// ---------------------------------------------------------------------------

async fn security_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "Cache-Control",
        header::HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert("Pragma", header::HeaderValue::from_static("no-cache"));
    headers.insert(
        "Strict-Transport-Security",
        header::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    resp
}

// ===========================================================================
// Tests
// ===========================================================================
