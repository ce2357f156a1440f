//! Protocol errors and their retry classification

use std::time::Duration;

use thiserror::Error;

/// Close codes after which reconnecting is expected to help
/// (internal error, service restart, try again later)
const RETRYABLE_CLOSE_CODES: [u16; 3] = [1011, 1012, 1013];

/// Errors raised while exchanging audio with the backend
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Link offline or no live session
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// Chunk index does not follow the previous one
    #[error("chunk {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    /// Connection refused, reset or otherwise failed at the I/O level
    #[error("network error: {0}")]
    Network(String),

    /// A single request exceeded its timeout
    #[error("request timed out")]
    Timeout,

    /// Backend answered with a 5xx status
    #[error("server error: HTTP {status}")]
    Server {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Backend answered with a non-2xx, non-5xx status
    #[error("request rejected: HTTP {0}")]
    Rejected(u16),

    /// Body could not be parsed
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Body exceeded the response size cap
    #[error("response exceeds {0} bytes")]
    TooLarge(usize),

    /// Audio payload could not be decoded
    #[error("undecodable audio: {0}")]
    Decode(String),

    /// Self-delimited frame header points past the payload
    #[error("frame overrun: {0}")]
    FrameOverrun(String),

    /// Exchange finished without any audio
    #[error("response carried no audio")]
    NoAudio,

    /// Nothing arrived within the response timeout after the final chunk
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// Persistent connection closed with a non-normal code
    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    /// Playback refused decoded audio
    #[error("playback rejected audio: {0}")]
    Playback(String),
}

impl ProtocolError {
    /// Whether re-attempting the exchange may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::Server { .. } | Self::ResponseTimeout(_) => {
                true
            }
            Self::Closed { code, .. } => RETRYABLE_CLOSE_CODES.contains(code),
            _ => false,
        }
    }

    /// Server-provided back-off hint
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status that was not a success
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        if (500..600).contains(&status) {
            Self::Server {
                status,
                retry_after,
            }
        } else {
            Self::Rejected(status)
        }
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), None)
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match e {
            WsError::Http(response) => Self::from_status(response.status().as_u16(), None),
            WsError::Utf8 => Self::Malformed("invalid utf-8 in text frame".to_string()),
            other => Self::Network(other.to_string()),
        }
    }
}
