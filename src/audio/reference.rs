//! Echo reference alignment
//!
//! Holds a short window of recently played audio, converted to the capture
//! rate, so the cleaning stage can pair each microphone window with "what the
//! speaker just emitted". An empty buffer means nothing is playing; the
//! aligner never invents non-silent filler.

use crate::audio::channel::{BoundedByteChannel, OverflowPolicy, SendOutcome};
use crate::audio::pcm::{BYTES_PER_SAMPLE, bytes_for_ms, bytes_to_samples, samples_to_bytes};
use crate::audio::resample::resample_linear;
use crate::Result;

/// Default reference window
pub const DEFAULT_REFERENCE_MS: u64 = 500;

/// Rate-converting buffer of recently played audio
#[derive(Debug)]
pub struct ReferenceAligner {
    channel: BoundedByteChannel,
    target_rate: u32,
}

impl ReferenceAligner {
    /// Create an aligner holding `buffer_ms` of audio at `target_rate`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the window rounds to zero bytes
    pub fn new(buffer_ms: u64, target_rate: u32) -> Result<Self> {
        let capacity = bytes_for_ms(buffer_ms, target_rate);
        let channel = BoundedByteChannel::new(capacity, OverflowPolicy::DropNewestOnFull)?;

        tracing::debug!(
            buffer_ms,
            capacity,
            sample_rate = target_rate,
            "echo reference buffer initialized"
        );

        Ok(Self {
            channel,
            target_rate,
        })
    }

    /// Sample rate the reference is delivered at
    #[must_use]
    pub const fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Mirror emitted playback audio recorded at `native_rate`
    ///
    /// Never blocks; under sustained overrun reference audio is discarded.
    pub fn feed(&self, pcm: &[i16], native_rate: u32) -> SendOutcome {
        if pcm.is_empty() {
            return SendOutcome::Sent;
        }

        let resampled = resample_linear(pcm, native_rate, self.target_rate);
        let outcome = self.channel.try_send(&samples_to_bytes(&resampled));
        if outcome == SendOutcome::Dropped {
            tracing::debug!(samples = resampled.len(), "reference buffer full, dropping");
        }
        outcome
    }

    /// Mirror emitted playback audio given as PCM16LE bytes
    pub fn feed_bytes(&self, pcm: &[u8], native_rate: u32) -> SendOutcome {
        self.feed(&bytes_to_samples(pcm), native_rate)
    }

    /// Pop up to `num_samples` reference samples, padding with silence
    ///
    /// The flag is `false` only when no reference was buffered at all, which
    /// signals that playback is not running.
    #[must_use]
    pub fn get(&self, num_samples: usize) -> (Vec<i16>, bool) {
        let bytes = self
            .channel
            .try_receive_upto(num_samples * BYTES_PER_SAMPLE);
        let mut samples = bytes_to_samples(&bytes);
        let had_data = !samples.is_empty();

        if samples.len() < num_samples {
            if had_data {
                tracing::trace!(
                    got = samples.len(),
                    wanted = num_samples,
                    "reference buffer underrun"
                );
            }
            samples.resize(num_samples, 0);
        }

        (samples, had_data)
    }

    /// Samples currently buffered
    #[must_use]
    pub fn buffered_samples(&self) -> usize {
        self.channel.occupied_bytes() / BYTES_PER_SAMPLE
    }

    /// Drop any buffered reference (playback was interrupted)
    pub fn reset(&self) {
        self.channel.drain_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_without_playback() {
        let aligner = ReferenceAligner::new(500, 16_000).unwrap();
        let (samples, had_data) = aligner.get(256);
        assert_eq!(samples, vec![0; 256]);
        assert!(!had_data);
    }

    #[test]
    fn feed_converts_to_capture_rate() {
        let aligner = ReferenceAligner::new(500, 16_000).unwrap();
        aligner.feed(&[1000; 1600], 24_000);
        assert_eq!(aligner.buffered_samples(), 1066);
    }

    #[test]
    fn partial_reference_is_padded() {
        let aligner = ReferenceAligner::new(500, 16_000).unwrap();
        aligner.feed(&[700; 30], 24_000);

        let (samples, had_data) = aligner.get(40);
        assert!(had_data);
        assert_eq!(samples.len(), 40);
        assert!(samples[..20].iter().all(|&s| s == 700));
        assert!(samples[20..].iter().all(|&s| s == 0));
    }

    #[test]
    fn overrun_drops_instead_of_blocking() {
        // 10 ms at 16 kHz = 160 samples
        let aligner = ReferenceAligner::new(10, 16_000).unwrap();
        assert_eq!(aligner.feed(&[1; 160], 16_000), SendOutcome::Sent);
        assert_eq!(aligner.feed(&[2; 16], 16_000), SendOutcome::Dropped);

        let (samples, _) = aligner.get(160);
        assert!(samples.iter().all(|&s| s == 1));
    }

    #[test]
    fn reset_clears_reference() {
        let aligner = ReferenceAligner::new(500, 16_000).unwrap();
        aligner.feed_bytes(&samples_to_bytes(&[5; 64]), 16_000);
        aligner.reset();
        assert!(!aligner.get(8).1);
    }
}
