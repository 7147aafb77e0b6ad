//! Streaming decoder for the cloud chat endpoint (text/event-stream).
//!
//! The wire carries `data:` lines whose payload is a JSON chunk of shape
//! `{content?, delta?, done?, error?, status?, blocked?, retryAfter?}`.
//! Chunks can be split mid-JSON across TCP frames, so the decoder buffers
//! bytes until a full line is available and never parses a partial line.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCode {
    Blocked,
    StreamError,
    Unauthorized,
    RateLimited,
    ApiError,
    NoBody,
    NetworkError,
    Timeout,
}

impl StreamErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorCode::Blocked => "BLOCKED",
            StreamErrorCode::StreamError => "STREAM_ERROR",
            StreamErrorCode::Unauthorized => "UNAUTHORIZED",
            StreamErrorCode::RateLimited => "RATE_LIMITED",
            StreamErrorCode::ApiError => "API_ERROR",
            StreamErrorCode::NoBody => "NO_BODY",
            StreamErrorCode::NetworkError => "NETWORK_ERROR",
            StreamErrorCode::Timeout => "TIMEOUT",
        }
    }
}

/// A decoded event from the chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    /// Incremental text.
    Delta(String),
    /// The stream finished; `content` is the final assistant message.
    Done { content: String },
    /// The stream failed.
    Error {
        code: StreamErrorCode,
        message: String,
        status: Option<u16>,
        retry_after: Option<u64>,
    },
}

// ── Decoder ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Chunk {
    content: Option<String>,
    delta: Option<String>,
    #[serde(default)]
    done: bool,
    error: Option<serde_json::Value>,
    status: Option<u16>,
    #[serde(default)]
    blocked: bool,
    retry_after: Option<u64>,
}

/// Push parser: feed it text as it arrives, collect events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: String,
    delta_buffer: String,
    /// Authoritative running content, when the server sends it.
    content: Option<String>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of stream text; returns the events completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<ChatStreamEvent> {
        let mut events = Vec::new();
        self.line_buffer.push_str(chunk);

        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            if self.finished {
                continue;
            }
            if let Some(event) = self.process_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Signal end-of-stream. Emits the completion if the server never sent
    /// an explicit `done`.
    pub fn finish(&mut self) -> Option<ChatStreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(ChatStreamEvent::Done {
            content: self.final_content(),
        })
    }

    fn final_content(&self) -> String {
        self.content
            .clone()
            .unwrap_or_else(|| self.delta_buffer.clone())
    }

    fn process_line(&mut self, line: &str) -> Option<ChatStreamEvent> {
        // Everything except data lines is ignored: blanks, comments,
        // `event:`, `id:`, `retry:`.
        let data = line.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data == "[DONE]" {
            return None;
        }

        let chunk: Chunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("skipping malformed stream chunk: {e}");
                return None;
            }
        };

        if let Some(error) = chunk.error {
            self.finished = true;
            let code = if chunk.blocked {
                StreamErrorCode::Blocked
            } else {
                StreamErrorCode::StreamError
            };
            let message = match error {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            return Some(ChatStreamEvent::Error {
                code,
                message,
                status: chunk.status,
                retry_after: chunk.retry_after,
            });
        }

        let mut out = None;
        if let Some(delta) = chunk.delta {
            self.delta_buffer.push_str(&delta);
            out = Some(ChatStreamEvent::Delta(delta));
        }
        if let Some(content) = chunk.content {
            self.content = Some(content);
        }
        if chunk.done {
            self.finished = true;
            // A done chunk replaces whatever delta we were about to emit.
            return Some(ChatStreamEvent::Done {
                content: self.final_content(),
            });
        }
        out
    }
}

// ── HTTP driver ─────────────────────────────────────────────────────────────

fn http_error_event(status: reqwest::StatusCode, retry_after: Option<u64>) -> ChatStreamEvent {
    let code = match status.as_u16() {
        401 => StreamErrorCode::Unauthorized,
        429 => StreamErrorCode::RateLimited,
        _ => StreamErrorCode::ApiError,
    };
    ChatStreamEvent::Error {
        code,
        message: format!("chat endpoint returned {status}"),
        status: Some(status.as_u16()),
        retry_after,
    }
}

/// Drive a streaming chat request, sending decoded events to `tx`.
///
/// Cancellation is a clean stop — no error event is emitted for it.
pub async fn stream_chat(
    http: &reqwest::Client,
    url: &str,
    bearer: &str,
    body: &serde_json::Value,
    tx: mpsc::Sender<ChatStreamEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let resp = match http.post(url).bearer_auth(bearer).json(body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            let code = if e.is_timeout() {
                StreamErrorCode::Timeout
            } else {
                StreamErrorCode::NetworkError
            };
            let _ = tx
                .send(ChatStreamEvent::Error {
                    code,
                    message: e.to_string(),
                    status: None,
                    retry_after: None,
                })
                .await;
            return Ok(());
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let _ = tx.send(http_error_event(status, retry_after)).await;
        return Ok(());
    }

    let mut decoder = SseDecoder::new();
    let mut stream = resp.bytes_stream();
    let mut received_any = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(bytes)) => {
                    received_any = received_any || !bytes.is_empty();
                    for event in decoder.feed(&String::from_utf8_lossy(&bytes)) {
                        let terminal = !matches!(event, ChatStreamEvent::Delta(_));
                        let _ = tx.send(event).await;
                        if terminal {
                            return Ok(());
                        }
                    }
                }
                Some(Err(e)) => {
                    let code = if e.is_timeout() {
                        StreamErrorCode::Timeout
                    } else {
                        StreamErrorCode::NetworkError
                    };
                    let _ = tx
                        .send(ChatStreamEvent::Error {
                            code,
                            message: format!("stream read failed: {e}"),
                            status: None,
                            retry_after: None,
                        })
                        .await;
                    return Ok(());
                }
                None => {
                    // A 2xx response that carried no body at all is an
                    // error, not an empty completion.
                    if !received_any {
                        let _ = tx
                            .send(ChatStreamEvent::Error {
                                code: StreamErrorCode::NoBody,
                                message: "chat endpoint returned no body".into(),
                                status: Some(status.as_u16()),
                                retry_after: None,
                            })
                            .await;
                        return Ok(());
                    }
                    if let Some(event) = decoder.finish() {
                        let _ = tx.send(event).await;
                    }
                    return Ok(());
                }
            }
        }
    }
}
