//! Microphone cleaning strategies
//!
//! The echo cancellation / noise suppression algorithm itself is an external
//! capability behind [`EchoCanceller`]. Both strategies share the same capture
//! pipeline and are selected at runtime.

use crate::audio::ReferenceAligner;
use crate::Result;

/// Opaque echo cancellation capability
///
/// Receives one microphone window and the time-aligned reference of what the
/// speaker emitted, returns the cleaned window.
pub trait EchoCanceller: Send + Sync {
    /// Window size the algorithm requires, if any
    fn preferred_chunk_samples(&self) -> Option<usize> {
        None
    }

    /// Clean one window
    ///
    /// # Errors
    ///
    /// Returns error if the algorithm rejects the input
    fn process(&mut self, mic: &[i16], reference: &[i16]) -> Result<Vec<i16>>;
}

/// How captured windows are treated before they leave the capture session
pub enum CleaningStrategy {
    /// Forward microphone audio unchanged
    Passthrough,
    /// Run every window through an echo canceller
    Active(Box<dyn EchoCanceller>),
}

impl std::fmt::Debug for CleaningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough => f.write_str("Passthrough"),
            Self::Active(_) => f.write_str("Active"),
        }
    }
}

impl CleaningStrategy {
    /// Chunk size negotiated with the strategy, if it needs a specific one
    #[must_use]
    pub fn chunk_samples(&self) -> Option<usize> {
        match self {
            Self::Passthrough => None,
            Self::Active(canceller) => canceller.preferred_chunk_samples(),
        }
    }

    /// Clean a full window
    ///
    /// Without an aligner (or with nothing playing) the canceller receives
    /// silence as reference. A failing canceller leaves the window untouched.
    pub fn clean(&mut self, window: Vec<i16>, reference: Option<&ReferenceAligner>) -> Vec<i16> {
        let Self::Active(canceller) = self else {
            return window;
        };

        let (reference, had_data) = reference.map_or_else(
            || (vec![0; window.len()], false),
            |aligner| aligner.get(window.len()),
        );

        match canceller.process(&window, &reference) {
            Ok(cleaned) => {
                tracing::trace!(samples = cleaned.len(), had_reference = had_data, "window cleaned");
                cleaned
            }
            Err(e) => {
                tracing::warn!(error = %e, "echo cancellation failed, forwarding raw window");
                window
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    /// Subtracts the reference from the microphone signal
    struct Subtract;

    impl EchoCanceller for Subtract {
        fn process(&mut self, mic: &[i16], reference: &[i16]) -> Result<Vec<i16>> {
            Ok(mic
                .iter()
                .zip(reference)
                .map(|(m, r)| m.saturating_sub(*r))
                .collect())
        }
    }

    struct Broken;

    impl EchoCanceller for Broken {
        fn preferred_chunk_samples(&self) -> Option<usize> {
            Some(512)
        }

        fn process(&mut self, _mic: &[i16], _reference: &[i16]) -> Result<Vec<i16>> {
            Err(Error::Cleaning("not ready".to_string()))
        }
    }

    #[test]
    fn passthrough_returns_window() {
        let mut strategy = CleaningStrategy::Passthrough;
        assert_eq!(strategy.clean(vec![1, 2, 3], None), vec![1, 2, 3]);
        assert_eq!(strategy.chunk_samples(), None);
    }

    #[test]
    fn active_uses_aligned_reference() {
        let aligner = ReferenceAligner::new(500, 16_000).unwrap();
        aligner.feed(&[100; 4], 16_000);

        let mut strategy = CleaningStrategy::Active(Box::new(Subtract));
        let cleaned = strategy.clean(vec![150; 4], Some(&aligner));
        assert_eq!(cleaned, vec![50; 4]);
    }

    #[test]
    fn active_without_playback_sees_silence() {
        let aligner = ReferenceAligner::new(500, 16_000).unwrap();
        let mut strategy = CleaningStrategy::Active(Box::new(Subtract));
        assert_eq!(strategy.clean(vec![7; 8], Some(&aligner)), vec![7; 8]);
    }

    #[test]
    fn failing_canceller_keeps_raw_audio() {
        let mut strategy = CleaningStrategy::Active(Box::new(Broken));
        assert_eq!(strategy.chunk_samples(), Some(512));
        assert_eq!(strategy.clean(vec![9; 4], None), vec![9; 4]);
    }
}
