/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Test doubles for the outbound collaborators.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::line::{LineError, OutgoingMessage, ReplySender};
use crate::relay::{CompletionClient, CompletionRequest, RelayError};

/// Records every reply instead of calling LINE.
#[derive(Default)]
pub struct RecordingReplies {
    sent: Mutex<Vec<(String, Vec<OutgoingMessage>)>>,
}

impl RecordingReplies {
    pub async fn sent(&self) -> Vec<(String, Vec<OutgoingMessage>)> {
        self.sent.lock().await.clone()
    }

    /// Text of the first message of every reply, in order.
    pub async fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|(_, msgs)| msgs.first())
            .map(|OutgoingMessage::Text { text, .. }| text.clone())
            .collect()
    }
}

#[async_trait]
impl ReplySender for RecordingReplies {
    async fn reply(
        &self,
        reply_token: &str,
        messages: &[OutgoingMessage],
    ) -> Result<(), LineError> {
        self.sent
            .lock()
            .await
            .push((reply_token.to_string(), messages.to_vec()));
        Ok(())
    }
}

/// Canned completion answer, or a one-shot error.
pub struct FakeCompletion {
    answer: String,
    error: std::sync::Mutex<Option<RelayError>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeCompletion {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            error: std::sync::Mutex::new(None),
            requests: Mutex::default(),
        }
    }

    pub fn failing(error: RelayError) -> Self {
        Self {
            answer: String::new(),
            error: std::sync::Mutex::new(Some(error)),
            requests: Mutex::default(),
        }
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl CompletionClient for FakeCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RelayError> {
        self.requests.lock().await.push(request.clone());
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        if self.answer.is_empty() {
            return Err(RelayError::MissingContent);
        }
        Ok(self.answer.clone())
    }
}
