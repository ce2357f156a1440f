//! Voice I/O sessions
//!
//! Capture (microphone to chunks), playback (decoded audio to speaker), the
//! cleaning strategies between them and the cpal device adapters.

mod capture;
mod cleaning;
mod device;
mod playback;

pub use capture::{CaptureConfig, CaptureEvent, CaptureSession, Microphone};
pub use cleaning::{CleaningStrategy, EchoCanceller};
pub use device::{CpalMicrophone, CpalSpeaker};
pub use playback::{PlaybackConfig, PlaybackEvent, PlaybackSession, Speaker};
