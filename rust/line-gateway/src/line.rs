/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! LINE Messaging API: webhook payloads, signature check and the reply call.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::departments::ReplyOption;

pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// LINE rejects text messages longer than this.
pub const MAX_TEXT_CHARS: usize = 5000;
const TRUNCATION_MARKER: &str = "…";

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// `signature` must be base64(HMAC-SHA256(channel_secret, body)).
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = match base64::engine::general_purpose::STANDARD.decode(signature.trim()) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let mut mac = match Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    constant_time_eq(&computed, &expected)
}

#[cfg(test)]
pub fn sign(channel_secret: &str, body: &[u8]) -> String {
    #[allow(clippy::unwrap_used)]
    let mut mac = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()).unwrap();
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
pub struct WebhookBody {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Follow {
        reply_token: String,
        source: Source,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        reply_token: String,
        source: Source,
        message: MessageContent,
    },
    /// Unfollow, postback, join and the rest.
    #[serde(other)]
    Other,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Follow { .. } => "follow",
            Self::Message { .. } => "message",
            Self::Other => "other",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    User,
    Group,
    Room,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
    /// Stickers, images, audio, location...
    #[serde(other)]
    Other,
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageAction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub label: String,
    pub text: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct QuickReplyItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub action: MessageAction,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct QuickReply {
    pub items: Vec<QuickReplyItem>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutgoingMessage {
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        quick_reply: Option<QuickReply>,
    },
}

impl OutgoingMessage {
    /// Text message, cut to the platform limit, with quick-reply buttons
    /// when `options` is non-empty.
    pub fn text(text: &str, options: &[ReplyOption]) -> Self {
        let quick_reply = (!options.is_empty()).then(|| QuickReply {
            items: options
                .iter()
                .map(|o| QuickReplyItem {
                    kind: "action",
                    action: MessageAction {
                        kind: "message",
                        label: o.label.clone(),
                        text: o.text.clone(),
                    },
                })
                .collect(),
        });
        Self::Text {
            text: truncate_text(text),
            quick_reply,
        }
    }
}

fn truncate_text(text: &str) -> String {
    if text.chars().count() <= MAX_TEXT_CHARS {
        return text.to_string();
    }
    let keep = MAX_TEXT_CHARS - TRUNCATION_MARKER.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

// ---------------------------------------------------------------------------
// Reply API
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("reply request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("reply API returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn reply(&self, reply_token: &str, messages: &[OutgoingMessage])
        -> Result<(), LineError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyBody<'a> {
    reply_token: &'a str,
    messages: &'a [OutgoingMessage],
}

pub struct LineReplyClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl LineReplyClient {
    /// # Errors
    ///
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(api_base: &str, access_token: &str, timeout_seconds: u64) -> Result<Self, LineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/v2/bot/message/reply", api_base.trim_end_matches('/')),
            access_token: access_token.to_string(),
        })
    }
}

#[async_trait]
impl ReplySender for LineReplyClient {
    async fn reply(
        &self,
        reply_token: &str,
        messages: &[OutgoingMessage],
    ) -> Result<(), LineError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&ReplyBody {
                reply_token,
                messages,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LineError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(count = messages.len(), "reply sent");
        Ok(())
    }
}
