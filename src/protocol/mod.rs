//! Chunked session protocol with the speech backend
//!
//! Two transports share one client: request/response HTTP (one POST per
//! chunk) and a persistent WebSocket. Replies are decoded to playback PCM and
//! every session resolves a single [`SessionOutcome`].

mod client;
pub mod codec;
mod error;
mod http;
pub mod retry;
mod transport;
mod websocket;
pub mod wire;

use std::time::Duration;

pub use client::{SessionHandle, SessionOutcome, SessionReport, StreamingProtocolClient};
pub use codec::{FrameDecoder, Mp3Decoder, PayloadDecoder, Pcm16Decoder, SelfDelimitedDecoder};
pub use error::ProtocolError;
pub use http::HttpTransport;
pub use retry::RetryPolicy;
pub use transport::{Downlink, InboundFrame, Transport, Uplink};
pub use websocket::WebSocketTransport;

/// Protocol timing and sizing
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Timeout for each non-final chunk upload
    pub chunk_timeout: Duration,
    /// Timeout for the reply after the final chunk
    pub response_timeout: Duration,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Interval between idle checks on the downlink
    pub idle_check_interval: Duration,
    /// Consecutive empty checks after which a streamed reply is complete
    pub idle_checks: u32,
    /// Chunks queued ahead of the uploader
    pub upload_queue: usize,
    /// Largest accepted response body
    pub max_response_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_check_interval: Duration::from_millis(200),
            idle_checks: 10,
            upload_queue: 64,
            max_response_bytes: 4 * 1024 * 1024,
        }
    }
}
