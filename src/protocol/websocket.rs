//! Persistent transport over a WebSocket
//!
//! Binary frames carry raw PCM16LE in both directions and an empty binary
//! frame from the device ends the turn. Text frames carry control messages
//! or NDJSON reply lines.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::audio::AudioChunk;
use crate::protocol::transport::{Downlink, InboundFrame, Transport, Uplink};
use crate::protocol::wire::{ControlMessage, ResponseBody, TOKEN_HEADER, decode_base64};
use crate::protocol::{ProtocolConfig, ProtocolError};

/// Close code reported when the peer closed without a status
const NO_STATUS_CODE: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport; one connection per session
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    token: Option<String>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(url: &str, token: Option<String>, config: &ProtocolConfig) -> Self {
        Self {
            url: url.to_string(),
            token,
            connect_timeout: config.connect_timeout,
            send_timeout: config.chunk_timeout,
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}session_id={}",
            self.url,
            urlencoding::encode(session_id)
        )
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        session_id: &str,
    ) -> Result<(Box<dyn Uplink>, Box<dyn Downlink>), ProtocolError> {
        let mut request = self.session_url(session_id).into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| ProtocolError::Network(format!("invalid token header: {e}")))?;
            request.headers_mut().insert(TOKEN_HEADER, value);
        }

        let (stream, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ProtocolError::Timeout)??;

        tracing::debug!(
            status = response.status().as_u16(),
            session_id,
            "websocket connected"
        );

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsUplink {
                sink,
                send_timeout: self.send_timeout,
            }),
            Box::new(WsDownlink {
                stream,
                pending: VecDeque::new(),
            }),
        ))
    }
}

struct WsUplink {
    sink: SplitSink<WsStream, Message>,
    send_timeout: Duration,
}

impl WsUplink {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), ProtocolError> {
        tokio::time::timeout(self.send_timeout, self.sink.send(Message::Binary(data)))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl Uplink for WsUplink {
    async fn send(&mut self, chunk: &AudioChunk) -> Result<(), ProtocolError> {
        if !chunk.is_empty() {
            self.send_binary(chunk.data.to_vec()).await?;
        }
        if chunk.is_final {
            self.send_binary(Vec::new()).await?;
            tracing::debug!(index = chunk.index, "turn ended");
        }
        Ok(())
    }
}

struct WsDownlink {
    stream: SplitStream<WsStream>,
    pending: VecDeque<InboundFrame>,
}

#[async_trait]
impl Downlink for WsDownlink {
    async fn next_frame(&mut self, wait: Duration) -> Result<Option<InboundFrame>, ProtocolError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }

        let message = match tokio::time::timeout(wait, self.stream.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(ProtocolError::Network("connection dropped".to_string()));
            }
            Ok(Some(message)) => message?,
        };

        match message {
            Message::Binary(data) => Ok(Some(InboundFrame::AudioDelta(data))),
            Message::Text(text) => {
                self.pending.extend(parse_text(&text)?);
                Ok(self.pending.pop_front())
            }
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((NO_STATUS_CODE, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                tracing::debug!(code, reason, "websocket closed by backend");
                Ok(Some(InboundFrame::Closed { code, reason }))
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(None),
        }
    }
}

/// Interpret a text frame as control messages or NDJSON reply lines
fn parse_text(text: &str) -> Result<Vec<InboundFrame>, ProtocolError> {
    let mut frames = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if value.get("type").is_some() {
            let control: ControlMessage = serde_json::from_value(value)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            match control {
                ControlMessage::SpeechStart => frames.push(InboundFrame::SpeechStart),
                ControlMessage::SpeechEnd => frames.push(InboundFrame::SpeechEnd),
                ControlMessage::Complete => frames.push(InboundFrame::Complete),
                ControlMessage::Unknown => {
                    tracing::debug!(message = line, "ignoring unknown control message");
                }
            }
            continue;
        }

        let reply = ResponseBody::parse(line)?;
        if let Some(error) = reply.error {
            return Err(ProtocolError::Malformed(format!("backend error: {error}")));
        }
        if let Some(delta) = &reply.audio_delta {
            frames.push(InboundFrame::AudioDelta(decode_base64(delta)?));
        }
        if let Some(audio) = &reply.audio_base64 {
            frames.push(InboundFrame::AudioDelta(decode_base64(audio)?));
        }
        if reply.is_complete() {
            frames.push(InboundFrame::Complete);
        }
    }

    Ok(frames)
}
