/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! HTTP handlers: the LINE webhook and the health endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, info, warn};

use crate::line::{Event, LineError, MessageContent, OutgoingMessage, SourceKind, WebhookBody};
use crate::profile::StoreError;
use crate::registration::Outcome;
use crate::{AppState, SERVICE_NAME};

#[derive(Debug, thiserror::Error)]
enum EventError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Line(#[from] LineError),
}

// ---------------------------------------------------------------------------
// POST /webhook, POST /callback
// ---------------------------------------------------------------------------

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(crate::line::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !crate::line::verify_signature(&state.channel_secret, &body, signature) {
        warn!(
            has_header = !signature.is_empty(),
            "webhook signature verification failed"
        );
        return (StatusCode::BAD_REQUEST, "invalid signature").into_response();
    }

    debug!(body = %String::from_utf8_lossy(&body), "webhook body");

    match serde_json::from_slice::<WebhookBody>(&body) {
        Ok(payload) => {
            info!(
                destination = payload.destination.as_deref().unwrap_or(""),
                events = payload.events.len(),
                "webhook received"
            );
            for event in &payload.events {
                if let Err(e) = handle_event(&state, event).await {
                    error!(event_type = event.kind(), error = %e, "event handling failed");
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "unparsable webhook body, acknowledging anyway");
        }
    }

    (StatusCode::OK, "OK").into_response()
}

async fn handle_event(state: &AppState, event: &Event) -> Result<(), EventError> {
    match event {
        Event::Follow {
            reply_token,
            source,
        } => {
            let Some(user_id) = source.user_id.as_deref() else {
                debug!("follow event without user id");
                return Ok(());
            };
            let prompt = state.registration.on_follow(user_id).await?;
            state
                .replies
                .reply(reply_token, &[OutgoingMessage::text(&prompt.text, &prompt.options)])
                .await?;
        }
        Event::Message {
            reply_token,
            source,
            message: MessageContent::Text { id, text },
        } => {
            let Some(user_id) = source.user_id.as_deref() else {
                debug!(group_id = ?source.group_id, room_id = ?source.room_id, "message without user id");
                return Ok(());
            };
            debug!(user_id, message_id = ?id, source = ?source.kind, "text message");
            let direct = source.kind == SourceKind::User;

            let reply = match state.registration.on_text(user_id, text, direct).await? {
                Outcome::Reply(prompt) => OutgoingMessage::text(&prompt.text, &prompt.options),
                Outcome::Relay { department } => {
                    let answer = state.relay.reply(text, department.as_deref()).await;
                    OutgoingMessage::text(&answer, &[])
                }
                Outcome::Ignore => return Ok(()),
            };
            state.replies.reply(reply_token, &[reply]).await?;
        }
        Event::Message { .. } | Event::Other => {
            debug!(event_type = event.kind(), "event ignored");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn ping_handler() -> &'static str {
    "OK"
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.ping().await;
    let status = if store_ok { "ok" } else { "degraded" };

    axum::Json(serde_json::json!({
        "status": status,
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "store": {
                "kind": state.store.kind(),
                "ok": store_ok,
            },
        },
    }))
}
