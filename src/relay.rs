use crate::io_struct::{ChatMessage, ChatReqInput, ErrorResponse, UpstreamChatRequest};
use crate::sse::{FrameReassembler, SseEvent, decode_event};
use actix_web::HttpResponse;
use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use bytes::Bytes;
use futures::{Stream, stream};
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Records queued between the pump task and the client transport. The bound
/// is what turns client-side backpressure into a suspended upstream read.
const OUTPUT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream rejected request ({status}): {message}")]
    UpstreamRejected {
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("upstream transport failure: {0}")]
    UpstreamTransport(#[source] reqwest::Error),

    #[error("upstream protocol error: {0}")]
    Protocol(#[from] crate::sse::SseError),

    #[error("required credential {0} is not set in the environment")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub model: String,
    pub max_completion_tokens: u32,
    /// Hard ceiling on one request lifecycle, including the full stream.
    pub timeout: u64,
    pub api_key: String,
}

/// Per-process relay state. Each request gets its own pump task and
/// channel; nothing here is mutated across requests.
#[derive(Debug, Clone)]
pub struct RelayState {
    client: reqwest::Client,
    upstream_url: String,
    model: String,
    max_completion_tokens: u32,
    api_key: String,
    timeout: Duration,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        Ok(Self {
            client,
            upstream_url: config.upstream_url.clone(),
            model: config.model.clone(),
            max_completion_tokens: config.max_completion_tokens,
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout),
        })
    }

    /// Opens the streaming completion request. A non-success status is
    /// resolved here, before anything is streamed to the client.
    async fn open_upstream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<reqwest::Response, RelayError> {
        let body = UpstreamChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            max_completion_tokens: self.max_completion_tokens,
        };
        let resp = self
            .client
            .post(&self.upstream_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(RelayError::UpstreamTransport)?;

        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                })
                .unwrap_or(raw);
            log::error!("upstream rejected request: {} {}", status, message);
            return Err(RelayError::UpstreamRejected { status, message });
        }
        Ok(resp)
    }

    pub async fn chat(&self, req: ChatReqInput) -> Result<HttpResponse, actix_web::Error> {
        let upstream = match self.open_upstream(req.messages).await {
            Ok(resp) => resp,
            Err(e) => return Ok(error_response(e)),
        };

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        actix_web::rt::spawn(pump_with_deadline(
            Box::pin(upstream.bytes_stream()),
            tx,
            self.timeout,
        ));

        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(HttpResponse::Ok()
            .insert_header((CONTENT_TYPE, "text/event-stream"))
            .insert_header((CACHE_CONTROL, "no-cache"))
            .streaming(body))
    }
}

fn error_response(err: RelayError) -> HttpResponse {
    let status = match &err {
        RelayError::UpstreamRejected { status, .. } => {
            actix_web::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY)
        }
        _ => actix_web::http::StatusCode::BAD_GATEWAY,
    };
    HttpResponse::build(status).json(ErrorResponse {
        error: err.to_string(),
    })
}

/// Runs the pump under the hard lifecycle ceiling. When the deadline fires
/// the pump future is dropped, which drops the upstream response and the
/// channel sender in one step, regardless of which await it was parked on.
pub async fn pump_with_deadline<S, E>(
    upstream: S,
    out: mpsc::Sender<Result<Bytes, actix_web::Error>>,
    ceiling: Duration,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    if tokio::time::timeout(ceiling, pump(upstream, out))
        .await
        .is_err()
    {
        log::warn!(
            "request exceeded the {}s lifecycle ceiling, cancelling",
            ceiling.as_secs()
        );
    }
}

/// Drives one upstream byte stream to completion, forwarding each decoded
/// record to the client channel as soon as it exists.
///
/// Exits on the first terminal condition: the `[DONE]` sentinel, clean
/// upstream end-of-stream, an upstream read or protocol error, or the client
/// going away. Disconnects surface both as a failed send and, while a read
/// is pending, through `Sender::closed`, so a vanished client interrupts
/// the read instead of waiting out the next chunk. Returning drops both the
/// channel sender and the upstream response, which closes the client stream
/// and cancels the in-flight upstream read in one step.
///
/// Errors after the first record can only be signalled by terminating the
/// body early; the success status is already on the wire.
pub async fn pump<S, E>(mut upstream: S, out: mpsc::Sender<Result<Bytes, actix_web::Error>>)
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut frames = FrameReassembler::new();
    loop {
        let next = tokio::select! {
            next = upstream.next() => next,
            _ = out.closed() => {
                log::debug!("client disconnected, cancelling upstream read");
                return;
            }
        };
        let Some(next) = next else {
            break;
        };
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                log::error!("upstream read failed mid-stream: {}", e);
                let _ = out
                    .send(Err(actix_web::error::ErrorBadGateway(
                        "upstream read failed",
                    )))
                    .await;
                return;
            }
        };
        let lines = match frames.feed(&chunk) {
            Ok(lines) => lines,
            Err(e) => {
                log::error!("{}", RelayError::from(e));
                let _ = out
                    .send(Err(actix_web::error::ErrorBadGateway(
                        "upstream protocol error",
                    )))
                    .await;
                return;
            }
        };
        for line in lines {
            match decode_event(&line) {
                Ok(SseEvent::Skip) => {}
                Ok(SseEvent::End) => return,
                Ok(SseEvent::Payload(value)) => {
                    let mut record = match serde_json::to_vec(&value) {
                        Ok(record) => record,
                        Err(e) => {
                            log::warn!("dropping unserializable record: {}", e);
                            continue;
                        }
                    };
                    record.push(b'\n');
                    if out.send(Ok(Bytes::from(record))).await.is_err() {
                        log::debug!("client disconnected, cancelling upstream read");
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("dropping malformed upstream event: {}", e);
                }
            }
        }
    }
    if frames.pending() > 0 {
        // Truncated trailing frame; nothing decodable to flush.
        log::warn!(
            "upstream stream ended with {} buffered bytes and no newline",
            frames.pending()
        );
    }
}
