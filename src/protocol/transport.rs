//! Transport abstraction shared by the request/response and persistent links

use std::time::Duration;

use async_trait::async_trait;

use crate::audio::AudioChunk;
use crate::protocol::ProtocolError;

/// Something the backend sent during a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Complete encoded reply, played as a one-shot
    Payload(Vec<u8>),
    /// Incremental encoded audio, streamed as it arrives
    AudioDelta(Vec<u8>),
    /// Backend detected the start of speech
    SpeechStart,
    /// Backend detected the end of speech
    SpeechEnd,
    /// Reply is complete
    Complete,
    /// Persistent connection closed
    Closed { code: u16, reason: String },
}

/// Opens one session-scoped link to the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the uplink and downlink for `session_id`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn open(
        &self,
        session_id: &str,
    ) -> Result<(Box<dyn Uplink>, Box<dyn Downlink>), ProtocolError>;
}

/// Device-to-backend half of a session
#[async_trait]
pub trait Uplink: Send {
    /// Transmit one chunk; chunks arrive here strictly in index order
    ///
    /// # Errors
    ///
    /// Returns error if the chunk could not be delivered
    async fn send(&mut self, chunk: &AudioChunk) -> Result<(), ProtocolError>;
}

/// Backend-to-device half of a session
#[async_trait]
pub trait Downlink: Send {
    /// Wait up to `wait` for the next frame; `None` means nothing arrived
    ///
    /// # Errors
    ///
    /// Returns error if the link failed
    async fn next_frame(&mut self, wait: Duration) -> Result<Option<InboundFrame>, ProtocolError>;
}
