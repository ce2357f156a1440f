//! Audio primitives
//!
//! Bounded buffers, PCM helpers, resampling and the echo reference shared by
//! the capture and playback sessions.

pub mod channel;
pub mod chunk;
pub mod pcm;
pub mod reference;
pub mod resample;
pub mod wav;

pub use channel::{BoundedByteChannel, OverflowPolicy, SendOutcome};
pub use chunk::AudioChunk;
pub use reference::ReferenceAligner;

/// Capture sample rate (16 kHz mono speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Playback sample rate (matches backend speech output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
