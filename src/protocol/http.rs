//! Request/response transport: one JSON POST per chunk
//!
//! Non-final chunks are acknowledged with `{"status":"partial"}`. The reply
//! to the final chunk carries the audio, either as one `audio_base64` object
//! or as NDJSON `audio_delta` lines ending with `{"status":"complete"}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio::sync::mpsc;

use crate::audio::AudioChunk;
use crate::protocol::retry::parse_retry_after;
use crate::protocol::transport::{Downlink, InboundFrame, Transport, Uplink};
use crate::protocol::wire::{
    NDJSON_CONTENT_TYPE, ResponseBody, TOKEN_HEADER, UploadRequest, decode_base64,
};
use crate::protocol::{ProtocolConfig, ProtocolError};
use crate::{Error, Result};

/// Frames buffered between the final request and the receiver
const REPLY_QUEUE: usize = 64;

/// HTTP upload transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    chunk_timeout: Duration,
    response_timeout: Duration,
    max_response_bytes: usize,
}

impl HttpTransport {
    /// Create a transport posting to `url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(url: &str, token: Option<String>, config: &ProtocolConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            token,
            chunk_timeout: config.chunk_timeout,
            response_timeout: config.response_timeout,
            max_response_bytes: config.max_response_bytes,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        session_id: &str,
    ) -> std::result::Result<(Box<dyn Uplink>, Box<dyn Downlink>), ProtocolError> {
        let (replies, rx) = mpsc::channel(REPLY_QUEUE);
        let uplink = HttpUplink {
            transport: self.clone(),
            session_id: session_id.to_string(),
            replies,
        };
        Ok((Box::new(uplink), Box::new(ReplyDownlink { rx })))
    }
}

struct HttpUplink {
    transport: HttpTransport,
    session_id: String,
    replies: mpsc::Sender<InboundFrame>,
}

#[async_trait]
impl Uplink for HttpUplink {
    async fn send(&mut self, chunk: &AudioChunk) -> std::result::Result<(), ProtocolError> {
        let t = &self.transport;
        let timeout = if chunk.is_final {
            t.response_timeout
        } else {
            t.chunk_timeout
        };

        let mut request = t
            .client
            .post(&t.url)
            .timeout(timeout)
            .json(&UploadRequest::new(&self.session_id, chunk));
        if let Some(token) = &t.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            tracing::warn!(
                status = status.as_u16(),
                index = chunk.index,
                "backend rejected chunk"
            );
            return Err(ProtocolError::from_status(status.as_u16(), retry_after));
        }

        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(NDJSON_CONTENT_TYPE));

        if !chunk.is_final {
            let body = read_capped(&mut response, t.max_response_bytes).await?;
            tracing::trace!(index = chunk.index, bytes = body.len(), "chunk acknowledged");
            return Ok(());
        }

        if streamed {
            self.forward_ndjson(&mut response).await
        } else {
            let body = read_capped(&mut response, t.max_response_bytes).await?;
            let text = String::from_utf8_lossy(&body);
            let reply = ResponseBody::parse(&text)?;
            if let Some(error) = reply.error {
                return Err(ProtocolError::Malformed(format!("backend error: {error}")));
            }
            let audio = reply
                .audio_base64
                .ok_or_else(|| ProtocolError::Malformed("reply has no audio_base64".to_string()))?;
            self.forward(InboundFrame::Payload(decode_base64(&audio)?))
                .await
        }
    }
}

impl HttpUplink {
    async fn forward(&self, frame: InboundFrame) -> std::result::Result<(), ProtocolError> {
        self.replies
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionUnavailable)
    }

    /// Forward each NDJSON line as it arrives
    async fn forward_ndjson(
        &self,
        response: &mut reqwest::Response,
    ) -> std::result::Result<(), ProtocolError> {
        let cap = self.transport.max_response_bytes;
        let mut pending: Vec<u8> = Vec::new();
        let mut total = 0usize;

        while let Some(bytes) = response.chunk().await? {
            total += bytes.len();
            if total > cap {
                return Err(ProtocolError::TooLarge(cap));
            }
            pending.extend_from_slice(&bytes);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if self.forward_line(&line).await? {
                    return Ok(());
                }
            }
        }

        if !self.forward_line(&pending).await? {
            // body ended without an explicit marker
            self.forward(InboundFrame::Complete).await?;
        }
        Ok(())
    }

    /// Returns true once the completion marker was forwarded
    async fn forward_line(&self, line: &[u8]) -> std::result::Result<bool, ProtocolError> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }

        let reply = ResponseBody::parse(text)?;
        if let Some(error) = reply.error {
            return Err(ProtocolError::Malformed(format!("backend error: {error}")));
        }
        if let Some(delta) = &reply.audio_delta {
            self.forward(InboundFrame::AudioDelta(decode_base64(delta)?))
                .await?;
        }
        if reply.is_complete() {
            self.forward(InboundFrame::Complete).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Read a whole body, refusing anything over `cap` bytes
async fn read_capped(
    response: &mut reqwest::Response,
    cap: usize,
) -> std::result::Result<Vec<u8>, ProtocolError> {
    if response
        .content_length()
        .is_some_and(|len| len > cap as u64)
    {
        return Err(ProtocolError::TooLarge(cap));
    }

    let mut body = Vec::new();
    while let Some(bytes) = response.chunk().await? {
        if body.len() + bytes.len() > cap {
            return Err(ProtocolError::TooLarge(cap));
        }
        body.extend_from_slice(&bytes);
    }
    Ok(body)
}

/// Receives frames produced by the final request
struct ReplyDownlink {
    rx: mpsc::Receiver<InboundFrame>,
}

#[async_trait]
impl Downlink for ReplyDownlink {
    async fn next_frame(
        &mut self,
        wait: Duration,
    ) -> std::result::Result<Option<InboundFrame>, ProtocolError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                // uplink finished; nothing more can arrive
                tokio::time::sleep(wait).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}
