//! Beacon Endpoint - audio and network core of a voice assistant device
//!
//! This library provides the streaming pipeline between a microphone, a
//! remote speech backend and a speaker:
//! - Bounded audio buffers and the echo reference
//! - Capture and playback sessions
//! - The chunked session protocol (HTTP or WebSocket)
//! - The assistant state machine sequencing an exchange
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  chunks   ┌─────────────────┐  upload  ┌─────────┐
//! │   Capture    ├──────────►│ Protocol client ├─────────►│ Backend │
//! └──────▲───────┘           └────────┬────────┘◄─────────┴─────────┘
//!        │ reference                  │ decoded audio        reply
//! ┌──────┴───────┐                    │
//! │   Playback   │◄───────────────────┘
//! └──────────────┘
//!        ▲ events, reports, intents
//! ┌──────┴──────────────────────────────────────┐
//! │            Assistant state machine          │
//! └─────────────────────────────────────────────┘
//! ```

pub mod assistant;
pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod voice;

pub use assistant::{
    Assistant, AssistantConfig, AssistantState, AssistantStatus, AssistantVariant, Components,
    Intent,
};
pub use audio::{AudioChunk, BoundedByteChannel, OverflowPolicy, ReferenceAligner, SendOutcome};
pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{ProtocolConfig, ProtocolError, SessionOutcome, StreamingProtocolClient};
pub use voice::{CaptureSession, CleaningStrategy, PlaybackSession};
