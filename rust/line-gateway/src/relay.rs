/*
 * DPIS Line Assistant - LINE registration and AI relay gateway
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Relay of verified users' questions to an OpenAI-compatible
//! chat-completion gateway.
//!
//! Gateways differ in where they mount the completion route, so the client
//! walks an ordered list of candidate paths. Only 403 and 404 move on to the
//! next candidate; any other failure ends the attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dpisline_config::AiConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("completion request timed out")]
    Timeout,
    #[error("completion transport error: {0}")]
    Transport(String),
    #[error("completion endpoint {path} returned {status}")]
    Status { status: u16, path: String },
    #[error("no completion endpoint accepted the request")]
    NoEndpoint,
    #[error("unparsable completion response: {0}")]
    Parse(String),
    #[error("completion response has no choices[0].message.content")]
    MissingContent,
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// One question with its optional system instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RelayError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    paths: Vec<String>,
}

impl HttpCompletionClient {
    /// # Errors
    ///
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(base_url: &str, api_key: &str, cfg: &AiConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            paths: cfg.completion_paths.clone(),
        })
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> ChatBody<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        ChatBody {
            model: &self.model,
            messages,
            temperature: self.temperature,
        }
    }
}

/// Pull `choices[0].message.content` out of a completion response body.
fn extract_content(body: &[u8]) -> Result<String, RelayError> {
    let data: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| RelayError::Parse(e.to_string()))?;
    match data
        .pointer("/choices/0/message/content")
        .and_then(serde_json::Value::as_str)
    {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(RelayError::MissingContent),
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RelayError> {
        let body = self.body(request);

        for path in &self.paths {
            let url = format!("{}{path}", self.base_url);
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;

            let status = resp.status();
            if status.is_success() {
                let bytes = resp.bytes().await?;
                debug!(path = %path, bytes = bytes.len(), "completion response");
                return extract_content(&bytes);
            }
            if matches!(status.as_u16(), 403 | 404) {
                info!(path = %path, status = status.as_u16(), "completion path rejected, trying next");
                continue;
            }
            return Err(RelayError::Status {
                status: status.as_u16(),
                path: path.clone(),
            });
        }
        Err(RelayError::NoEndpoint)
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Builds the department-aware system prompt and turns every failure into
/// the apology text.
pub struct AiRelay {
    client: Arc<dyn CompletionClient>,
    system_prompt: String,
    default_audience: String,
    apology: String,
}

impl AiRelay {
    pub fn new(client: Arc<dyn CompletionClient>, cfg: &AiConfig) -> Self {
        Self {
            client,
            system_prompt: cfg.system_prompt.clone(),
            default_audience: cfg.default_audience.clone(),
            apology: cfg.apology.clone(),
        }
    }

    fn system_for(&self, department: Option<&str>) -> String {
        let audience = department
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.default_audience);
        self.system_prompt.replace("{department}", audience)
    }

    /// Answer `prompt` for a user of `department`. Never fails.
    pub async fn reply(&self, prompt: &str, department: Option<&str>) -> String {
        let request = CompletionRequest {
            system: Some(self.system_for(department)),
            prompt: prompt.to_string(),
        };
        match self.client.complete(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "completion failed, sending apology");
                self.apology.clone()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};

    use crate::testing::FakeCompletion;

    /// Counts hits per route and remembers the last request seen.
    #[derive(Default)]
    struct Hits {
        first: AtomicUsize,
        second: AtomicUsize,
        third: AtomicUsize,
        last_auth: std::sync::Mutex<Option<String>>,
        last_body: std::sync::Mutex<Option<serde_json::Value>>,
    }

    fn ok_body(text: &str) -> serde_json::Value {
        serde_json::json!({ "choices": [{ "message": { "role": "assistant", "content": text } }] })
    }

    /// Spawn a gateway where `/first`, `/second` and `/third` answer with the
    /// given status; 200 answers carry `body`.
    async fn spawn_gateway(
        statuses: [u16; 3],
        body: &'static str,
    ) -> (String, Arc<Hits>) {
        let hits = Arc::new(Hits::default());

        async fn answer(
            status: u16,
            body: &'static str,
            hits: &Hits,
            headers: &HeaderMap,
            json: serde_json::Value,
        ) -> axum::response::Response {
            *hits.last_auth.lock().unwrap() = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            *hits.last_body.lock().unwrap() = Some(json);
            let code = StatusCode::from_u16(status).unwrap();
            (code, [("content-type", "application/json")], body).into_response()
        }

        let [s1, s2, s3] = statuses;
        let app = Router::new()
            .route(
                "/first",
                post(
                    move |State(h): State<Arc<Hits>>, headers: HeaderMap, Json(v): Json<serde_json::Value>| async move {
                        h.first.fetch_add(1, Ordering::SeqCst);
                        answer(s1, body, &h, &headers, v).await
                    },
                ),
            )
            .route(
                "/second",
                post(
                    move |State(h): State<Arc<Hits>>, headers: HeaderMap, Json(v): Json<serde_json::Value>| async move {
                        h.second.fetch_add(1, Ordering::SeqCst);
                        answer(s2, body, &h, &headers, v).await
                    },
                ),
            )
            .route(
                "/third",
                post(
                    move |State(h): State<Arc<Hits>>, headers: HeaderMap, Json(v): Json<serde_json::Value>| async move {
                        h.third.fetch_add(1, Ordering::SeqCst);
                        answer(s3, body, &h, &headers, v).await
                    },
                ),
            )
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn client(base_url: &str) -> HttpCompletionClient {
        let cfg = AiConfig {
            completion_paths: vec![
                "/first".to_string(),
                "/second".to_string(),
                "/third".to_string(),
            ],
            timeout_seconds: 5,
            ..AiConfig::default()
        };
        HttpCompletionClient::new(base_url, "sk-test", &cfg).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: Some("system text".to_string()),
            prompt: "วิธีลาพักร้อน".to_string(),
        }
    }

    const OK_JSON: &str =
        r#"{"choices":[{"message":{"role":"assistant","content":"คำตอบ"}}]}"#;

    #[tokio::test]
    async fn test_first_path_success_sends_expected_request() {
        let (base, hits) = spawn_gateway([200, 200, 200], OK_JSON).await;
        let text = client(&base).complete(&request()).await.unwrap();
        assert_eq!(text, "คำตอบ");
        assert_eq!(hits.first.load(Ordering::SeqCst), 1);
        assert_eq!(hits.second.load(Ordering::SeqCst), 0);

        assert_eq!(
            hits.last_auth.lock().unwrap().as_deref(),
            Some("Bearer sk-test")
        );
        let body = hits.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "hrms-dpis6");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "system text");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "วิธีลาพักร้อน");
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_not_found_moves_to_next_path() {
        let (base, hits) = spawn_gateway([404, 200, 200], OK_JSON).await;
        let text = client(&base).complete(&request()).await.unwrap();
        assert_eq!(text, "คำตอบ");
        assert_eq!(hits.first.load(Ordering::SeqCst), 1);
        assert_eq!(hits.second.load(Ordering::SeqCst), 1);
        assert_eq!(hits.third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_other_status_aborts_probing() {
        let (base, hits) = spawn_gateway([403, 500, 200], OK_JSON).await;
        let err = client(&base).complete(&request()).await.unwrap_err();
        match err {
            RelayError::Status { status, path } => {
                assert_eq!(status, 500);
                assert_eq!(path, "/second");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(hits.third.load(Ordering::SeqCst), 0, "third path never tried");
    }

    #[tokio::test]
    async fn test_all_paths_rejected() {
        let (base, _hits) = spawn_gateway([404, 403, 404], OK_JSON).await;
        let err = client(&base).complete(&request()).await.unwrap_err();
        assert!(matches!(err, RelayError::NoEndpoint));
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (base, _hits) = spawn_gateway([200, 200, 200], "not json {").await;
        let err = client(&base).complete(&request()).await.unwrap_err();
        assert!(matches!(err, RelayError::Parse(_)));
    }

    #[tokio::test]
    async fn test_missing_content() {
        let (base, _hits) = spawn_gateway([200, 200, 200], r#"{"choices":[]}"#).await;
        let err = client(&base).complete(&request()).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingContent));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(&format!("http://{addr}"))
            .complete(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_server_error_becomes_apology() {
        let (base, _hits) = spawn_gateway([500, 200, 200], OK_JSON).await;
        let cfg = AiConfig::default();
        let relay = AiRelay::new(Arc::new(client(&base)), &cfg);
        let text = relay.reply("คำถาม", Some("กรมสรรพากร")).await;
        assert_eq!(text, cfg.apology);
    }

    #[test]
    fn test_extract_content() {
        let body = serde_json::to_vec(&ok_body("hi")).unwrap();
        assert_eq!(extract_content(&body).unwrap(), "hi");
        assert!(matches!(
            extract_content(br#"{"choices":[{"message":{"content":"  "}}]}"#),
            Err(RelayError::MissingContent)
        ));
        assert!(matches!(
            extract_content(br#"{"choices":[{"message":{"content":null}}]}"#),
            Err(RelayError::MissingContent)
        ));
    }

    #[tokio::test]
    async fn test_system_prompt_names_department() {
        let fake = Arc::new(FakeCompletion::answering("ok"));
        let relay = AiRelay::new(fake.clone(), &AiConfig::default());

        assert_eq!(relay.reply("q1", Some("กรมศุลกากร")).await, "ok");
        relay.reply("q2", None).await;
        relay.reply("q3", Some("  ")).await;

        let seen = fake.requests().await;
        assert_eq!(seen.len(), 3);
        let system = seen[0].system.as_deref().unwrap();
        assert!(system.contains("กรมศุลกากร"));
        assert!(!system.contains("{department}"));
        assert!(seen[1].system.as_deref().unwrap().contains("ผู้ใช้ทั่วไป"));
        assert!(seen[2].system.as_deref().unwrap().contains("ผู้ใช้ทั่วไป"));
        assert_eq!(seen[0].prompt, "q1");
    }

    #[tokio::test]
    async fn test_every_error_kind_maps_to_apology() {
        let cfg = AiConfig::default();
        for err in [
            RelayError::Timeout,
            RelayError::NoEndpoint,
            RelayError::MissingContent,
            RelayError::Parse("x".to_string()),
        ] {
            let relay = AiRelay::new(Arc::new(FakeCompletion::failing(err)), &cfg);
            assert_eq!(relay.reply("q", None).await, cfg.apology);
        }
    }
}
