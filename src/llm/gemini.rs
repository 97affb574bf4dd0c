//! Gemini provider implementation
//!
//! Non-streaming generation goes through `:generateContent`; streaming uses
//! `:streamGenerateContent?alt=sse` and decodes the SSE byte stream into
//! [`StreamEvent`]s.

use super::types::{GenRequest, Role};
use super::{FragmentStream, GenerationService, LlmError, StreamEvent};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Gemini API client.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: impl Into<String>) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, method: &str, sse: bool) -> String {
        let alt = if sse { "&alt=sse" } else { "" };
        format!(
            "{}/{}:{method}?key={}{alt}",
            self.base_url, self.model, self.api_key
        )
    }

    fn translate_request(request: &GenRequest) -> GeminiRequest {
        let contents = request
            .turns
            .iter()
            .map(|turn| GeminiContent {
                role: Some(
                    match turn.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: vec![GeminiPart {
                    text: Some(turn.text.clone()),
                }],
            })
            .collect();

        let system_instruction = if request.system.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(request.system.clone()),
                }],
            })
        };

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: GeminiGenerationConfig {
                temperature: request.config.temperature,
                top_p: request.config.top_p,
                top_k: request.config.top_k,
                max_output_tokens: request.config.max_output_tokens,
                response_mime_type: "text/plain".to_string(),
            },
        }
    }

    async fn send(&self, url: &str, body: &GeminiRequest) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        if let Ok(error_resp) = serde_json::from_str::<GeminiErrorResponse>(&body) {
            let message = error_resp.error.message;
            return Err(match status.as_u16() {
                400 => LlmError::invalid_request(format!("Invalid request: {message}")),
                401 | 403 => LlmError::auth(format!("Authentication failed: {message}")),
                429 => LlmError::rate_limit(format!("Rate limit exceeded: {message}")),
                500..=599 => LlmError::server_error(format!("Server error: {message}")),
                _ => LlmError::unknown(format!("HTTP {status}: {message}")),
            });
        }
        Err(LlmError::unknown(format!("HTTP {status} error: {body}")))
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn complete(&self, request: &GenRequest) -> Result<String, LlmError> {
        let body = Self::translate_request(request);
        let response = self.send(&self.url("generateContent", false), &body).await?;

        let raw = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;
        let parsed: GeminiResponse = serde_json::from_str(&raw)
            .map_err(|e| LlmError::unknown(format!("Failed to parse response: {e}")))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::unknown("No candidates in response"))?;

        Ok(candidate_text(&candidate))
    }

    async fn stream(&self, request: &GenRequest) -> Result<FragmentStream, LlmError> {
        let body = Self::translate_request(request);
        let response = self
            .send(&self.url("streamGenerateContent", true), &body)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_sse(response, tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Pump the SSE byte stream into stream events. Runs until the stream ends,
/// a terminal event fires, or the receiver goes away.
async fn drive_sse(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<Result<StreamEvent, LlmError>>,
) {
    let mut bytes = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(item) = bytes.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                // Transport failures propagate, no retry.
                let _ = tx.send(Err(LlmError::network(format!("Stream error: {e}"))));
                return;
            }
        };

        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
            if !emit_line(&line_bytes, &tx) {
                return;
            }
        }
    }

    // SSE payloads are newline-terminated, but flush any trailing bytes.
    if !buf.is_empty() {
        emit_line(&buf, &tx);
    }
}

/// Decode one raw SSE line and forward its events. Returns false when the
/// stream should stop (terminal event or dropped receiver).
fn emit_line(
    line_bytes: &[u8],
    tx: &mpsc::UnboundedSender<Result<StreamEvent, LlmError>>,
) -> bool {
    let Ok(line) = std::str::from_utf8(line_bytes) else {
        // Undecodable bytes truncate the stream, same as a safety stop.
        let _ = tx.send(Ok(StreamEvent::Blocked));
        return false;
    };

    let Some(action) = parse_stream_line(line.trim_end_matches(['\r', '\n'])) else {
        return true;
    };

    for fragment in action.fragments {
        if tx.send(Ok(StreamEvent::Fragment(fragment))).is_err() {
            return false;
        }
    }
    if action.blocked {
        let _ = tx.send(Ok(StreamEvent::Blocked));
        return false;
    }
    true
}

/// Decoded effect of one SSE `data:` line.
#[derive(Debug, Default, PartialEq)]
struct LineAction {
    fragments: Vec<String>,
    blocked: bool,
}

/// Parse one SSE line. Returns `None` for comments, blank lines, and other
/// non-data fields. A `data:` payload that is not valid chunk JSON is a
/// decode failure and reports as blocked.
fn parse_stream_line(line: &str) -> Option<LineAction> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }

    let Ok(chunk) = serde_json::from_str::<GeminiStreamChunk>(payload) else {
        return Some(LineAction {
            fragments: Vec::new(),
            blocked: true,
        });
    };

    if chunk
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_ref())
        .is_some()
    {
        return Some(LineAction {
            fragments: Vec::new(),
            blocked: true,
        });
    }

    let mut action = LineAction::default();
    if let Some(candidate) = chunk.candidates.first() {
        for text in candidate_fragments(candidate) {
            action.fragments.push(text);
        }
        if let Some(reason) = &candidate.finish_reason {
            // STOP and MAX_TOKENS are normal completions; everything else
            // (SAFETY, RECITATION, ...) truncates.
            if reason != "STOP" && reason != "MAX_TOKENS" {
                action.blocked = true;
            }
        }
    }
    Some(action)
}

fn candidate_fragments(candidate: &GeminiCandidate) -> Vec<String> {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.clone())
                .filter(|text| !text.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn candidate_text(candidate: &GeminiCandidate) -> String {
    candidate_fragments(candidate).join("")
}

// Gemini API types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}
