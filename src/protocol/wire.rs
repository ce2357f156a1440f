//! JSON shapes exchanged with the backend

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::audio::AudioChunk;
use crate::protocol::ProtocolError;

/// Header carrying the shared assistant token
pub const TOKEN_HEADER: &str = "X-Assistant-Token";

/// Content type of streamed (newline-delimited) responses
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One uploaded chunk
#[derive(Debug, Serialize)]
pub struct UploadRequest<'a> {
    pub session_id: &'a str,
    pub chunk_index: u32,
    pub pcm_base64: String,
    pub is_final: bool,
}

impl<'a> UploadRequest<'a> {
    #[must_use]
    pub fn new(session_id: &'a str, chunk: &AudioChunk) -> Self {
        Self {
            session_id,
            chunk_index: chunk.index,
            pcm_base64: STANDARD.encode(&chunk.data),
            is_final: chunk.is_final,
        }
    }
}

/// Any object the backend may send back
///
/// Covers the partial acknowledgement, the complete one-shot reply and each
/// line of a streamed reply.
#[derive(Debug, Default, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub audio_delta: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseBody {
    /// Parse one JSON object
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the text is not a JSON object of this shape
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Whether this object marks the end of a streamed reply
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("complete")
    }
}

/// Control message on the persistent connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SpeechStart,
    SpeechEnd,
    Complete,
    #[serde(other)]
    Unknown,
}

/// Decode a base64 audio field
///
/// # Errors
///
/// Returns `Malformed` for invalid base64
pub fn decode_base64(field: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(field.trim())
        .map_err(|e| ProtocolError::Malformed(format!("invalid base64 audio: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_request_shape() {
        let chunk = AudioChunk::new(3, vec![1, 0, 2, 0], true);
        let json = serde_json::to_value(UploadRequest::new("abc", &chunk)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "session_id": "abc",
                "chunk_index": 3,
                "pcm_base64": "AQACAA==",
                "is_final": true,
            })
        );
    }

    #[test]
    fn parses_reply_variants() {
        assert_eq!(
            ResponseBody::parse(r#"{"status":"partial"}"#).unwrap().status.as_deref(),
            Some("partial")
        );
        assert!(ResponseBody::parse(r#"{"status":"complete"}"#).unwrap().is_complete());
        assert_eq!(
            ResponseBody::parse(r#"{"audio_delta":"AAA="}"#).unwrap().audio_delta.as_deref(),
            Some("AAA=")
        );
        assert!(ResponseBody::parse("{\"audio_base64\": ").is_err());
    }

    #[test]
    fn parses_control_messages() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"speech_start"}"#).unwrap();
        assert_eq!(msg, ControlMessage::SpeechStart);
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"mystery"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Unknown);
    }

    #[test]
    fn bad_base64_is_malformed() {
        assert!(matches!(
            decode_base64("***"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(decode_base64("AQI=").unwrap(), vec![1, 2]);
    }
}
