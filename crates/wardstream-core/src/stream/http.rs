//! HTTP event-stream transport.
//!
//! Opens a long-lived GET per topic against the analysis backend and decodes
//! server-sent-event blocks into frames. The connect call resolves once the
//! response headers arrive, which is the server's acknowledgement; frame
//! reading happens on a background task owned by the returned handle.

use crate::cancel::CancellationToken;
use crate::config::TransportPolicy;
use crate::error::{CoreError, Result};
use crate::stream::message::{StreamFrame, StreamParams};
use crate::stream::transport::{StreamEvent, StreamHandle, StreamTransport};
use crate::transport::TransportTuning;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Capacity of the per-stream event channel between reader and manager.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connect timeout for the underlying client. The overall request carries no
/// timeout: the stream stays open as long as the server keeps it alive.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream transport over HTTP server-sent events.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpStreamTransport {
    /// Build a transport for a backend base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Self::with_client(client, base_url)
    }

    /// Build a transport reusing an existing client.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| CoreError::Config {
            message: format!("Invalid stream base URL {}: {}", base_url, e),
        })?;
        Ok(Self { client, base_url })
    }

    /// Build the stream URL for a topic, encoding request parameters and the
    /// current tuning hints as query parameters.
    fn stream_url(
        &self,
        topic: &str,
        params: &StreamParams,
        tuning: &TransportTuning,
    ) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("streams/{}", topic))
            .map_err(|e| CoreError::Config {
                message: format!("Invalid stream URL for topic {}: {}", topic, e),
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("depth", params.depth.as_str());
            if let Some(context) = &params.context {
                query.append_pair("context", context);
            }
            query.append_pair("max_bytes", &tuning.max_message_bytes.to_string());
            query.append_pair("batch", &tuning.batch_size.to_string());
            if tuning.compression_enabled {
                // Compression only pays for itself above a minimum payload
                // size; advertise that floor alongside the request.
                query.append_pair("compress", "1");
                query.append_pair(
                    "compress_min",
                    &TransportPolicy::COMPRESSION_THRESHOLD_BYTES.to_string(),
                );
            }
        }
        Ok(url)
    }
}

/// Whether an HTTP status is worth retrying.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn connect(
        &self,
        topic: &str,
        params: &StreamParams,
        tuning: &TransportTuning,
    ) -> Result<StreamHandle> {
        let url = self.stream_url(topic, params, tuning)?;
        debug!("Opening event stream: {}", url);

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("Stream request for {} returned {}", topic, status);
            return Err(if is_retryable_status(status) {
                CoreError::Transport {
                    message,
                    cause: None,
                }
            } else {
                CoreError::Protocol { message }
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let topic = topic.to_string();
        let max_block_bytes = tuning.max_message_bytes;

        tokio::spawn(async move {
            read_event_stream(response, tx, cancel, topic, max_block_bytes).await;
        });

        Ok(StreamHandle::new(rx, reader_cancel))
    }
}

/// Drive one response body to completion, emitting stream events.
async fn read_event_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    topic: String,
    max_block_bytes: usize,
) {
    let mut body = response.bytes_stream();
    let mut framer = SseFramer::new(max_block_bytes);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event stream reader for {} cancelled", topic);
                return;
            }
            chunk = body.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx
                    .send(StreamEvent::Closed {
                        clean: false,
                        message: Some(e.to_string()),
                    })
                    .await;
                return;
            }
            None => {
                // Body ended without an explicit end event.
                let _ = tx
                    .send(StreamEvent::Closed {
                        clean: false,
                        message: None,
                    })
                    .await;
                return;
            }
        };

        for block in framer.push(&bytes) {
            let event = match decode_block(&block) {
                BlockContent::Frame(frame) => StreamEvent::Frame(frame),
                BlockContent::End { message } => {
                    let _ = tx
                        .send(StreamEvent::Closed {
                            clean: true,
                            message,
                        })
                        .await;
                    return;
                }
                BlockContent::Malformed { message } => {
                    warn!("Undecodable event block on {}: {}", topic, message);
                    StreamEvent::Malformed { message }
                }
                BlockContent::Empty => continue,
            };
            if tx.send(event).await.is_err() {
                // Handle dropped; nobody is listening anymore.
                return;
            }
        }
    }
}

/// What one decoded SSE block contained.
enum BlockContent {
    Frame(StreamFrame),
    End { message: Option<String> },
    Malformed { message: String },
    Empty,
}

/// Decode one SSE block (the text between blank lines) into its content.
///
/// Data lines are concatenated with newlines per the SSE wire format;
/// comment lines (leading `:`) and unknown fields are ignored.
fn decode_block(block: &[u8]) -> BlockContent {
    let text = String::from_utf8_lossy(block);
    let mut event_name: Option<&str> = None;
    let mut data = String::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_name = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        }
    }

    if event_name == Some("end") {
        let message = if data.is_empty() { None } else { Some(data) };
        return BlockContent::End { message };
    }
    if data.is_empty() {
        return BlockContent::Empty;
    }

    match serde_json::from_str::<StreamFrame>(&data) {
        Ok(frame) => BlockContent::Frame(frame),
        Err(e) => BlockContent::Malformed {
            message: format!("{} in frame {:?}", e, truncate(&data, 120)),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Reassembles SSE blocks from arbitrary byte chunks.
///
/// Blocks are delimited by a blank line. A block larger than the advertised
/// maximum is surfaced as one oversized block and left to the decoder to
/// reject, so a runaway server cannot grow the buffer without bound.
struct SseFramer {
    buffer: Vec<u8>,
    max_block_bytes: usize,
}

impl SseFramer {
    fn new(max_block_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_block_bytes,
        }
    }

    /// Feed a chunk; returns every complete block it finished.
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut blocks = Vec::new();
        while let Some((end, delim)) = find_block_end(&self.buffer) {
            let mut block: Vec<u8> = self.buffer.drain(..end + delim).collect();
            block.truncate(end);
            if !block.is_empty() {
                blocks.push(block);
            }
        }

        if self.buffer.len() > self.max_block_bytes {
            // Flush the oversized partial as-is; the decoder reports it.
            blocks.push(std::mem::take(&mut self.buffer));
        }
        blocks
    }
}

/// First block delimiter in the buffer, as `(content_len, delimiter_len)`.
/// Both the LF (`\n\n`) and CRLF (`\r\n\r\n`) spellings are recognized.
fn find_block_end(buffer: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buffer.len().saturating_sub(1) {
        if buffer[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
        if buffer[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
    }
    None
}
