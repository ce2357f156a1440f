//! PCM16 sample helpers
//!
//! The canonical in-pipeline representation is mono, signed 16-bit,
//! little-endian PCM.

/// Bytes per PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Full-scale volume; scaling is skipped entirely at this level
pub const MAX_VOLUME: u8 = 100;

/// Convert an f32 sample in [-1.0, 1.0] to PCM16
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert a PCM16 sample to f32 in [-1.0, 1.0)
#[must_use]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Serialize samples as little-endian bytes
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse little-endian bytes into samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Scale every sample in place by `volume` percent (clamped to 0..=100)
///
/// `sample' = sample * volume / 100`; full volume is a no-op.
pub fn apply_volume(pcm: &mut [u8], volume: u8) {
    let volume = volume.min(MAX_VOLUME);
    if volume == MAX_VOLUME {
        return;
    }

    for pair in pcm.chunks_exact_mut(BYTES_PER_SAMPLE) {
        let sample = i32::from(i16::from_le_bytes([pair[0], pair[1]]));
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (sample * i32::from(volume) / i32::from(MAX_VOLUME)) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Duration of `bytes` of PCM16 mono audio at `sample_rate`, in milliseconds
#[must_use]
pub fn duration_ms(bytes: usize, sample_rate: u32) -> u64 {
    (bytes / BYTES_PER_SAMPLE) as u64 * 1000 / u64::from(sample_rate.max(1))
}

/// Number of PCM16 mono bytes covering `ms` milliseconds at `sample_rate`
#[must_use]
pub fn bytes_for_ms(ms: u64, sample_rate: u32) -> usize {
    usize::try_from(u64::from(sample_rate) * ms / 1000).unwrap_or(usize::MAX) * BYTES_PER_SAMPLE
}
