//! Resampling
//!
//! Two flavours:
//! - [`resample_linear`] keeps block lengths exact for the echo reference,
//!   where only monotonic time alignment between the clocks matters
//! - [`resample_clip`] runs a band-limited rubato resampler over a whole clip
//!   (decoded reply audio, WAV files)

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Requested input frames per rubato process call
const CLIP_CHUNK: usize = 1024;

/// Full scale of a PCM16 sample
const PCM16_SCALE: f64 = 32_768.0;

/// Number of output samples produced for `input_len` samples
///
/// `⌊input_len * output_rate / input_rate⌋`
#[must_use]
pub fn output_len(input_len: usize, input_rate: u32, output_rate: u32) -> usize {
    if input_rate == 0 {
        return 0;
    }
    let len = input_len as u64 * u64::from(output_rate) / u64::from(input_rate);
    usize::try_from(len).unwrap_or(usize::MAX)
}

/// Resample mono PCM16 from `input_rate` to `output_rate`
///
/// Output positions at or past the last input sample hold that sample, so the
/// final indices never read out of bounds.
#[must_use]
pub fn resample_linear(input: &[i16], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if input.is_empty() || input_rate == 0 || output_rate == 0 {
        return Vec::new();
    }
    if input_rate == output_rate {
        return input.to_vec();
    }

    let len = output_len(input.len(), input_rate, output_rate);
    let last = input.len() - 1;
    let step = f64::from(input_rate) / f64::from(output_rate);

    (0..len)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let position = i as f64 * step;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = position as usize;

            if index >= last {
                return input[last];
            }

            #[allow(clippy::cast_precision_loss)]
            let frac = position - index as f64;
            lerp(input[index], input[index + 1], frac)
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn lerp(s0: i16, s1: i16, frac: f64) -> i16 {
    let s0 = f64::from(s0);
    (s0 + frac * (f64::from(s1) - s0)) as i16
}

/// Resample a whole mono clip with one band-limited resampler
///
/// The resampler state carries across the clip, so no samples are lost at
/// internal block boundaries. The filter delay is flushed and trimmed; the
/// result holds exactly `output_len(input.len(), ..)` samples.
///
/// # Errors
///
/// Returns `Audio` if the resampler rejects the rates
pub fn resample_clip(input: &[i16], input_rate: u32, output_rate: u32) -> Result<Vec<i16>> {
    if input.is_empty() || input_rate == 0 || output_rate == 0 {
        return Ok(Vec::new());
    }
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f64>::new(input_rate as usize, output_rate as usize, CLIP_CHUNK, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let wanted = output_len(input.len(), input_rate, output_rate);
    let delay = resampler.output_delay();
    let samples: Vec<f64> = input.iter().map(|&s| f64::from(s) / PCM16_SCALE).collect();
    let mut output: Vec<f64> = Vec::with_capacity(delay + wanted + CLIP_CHUNK);

    let mut blocks = samples.chunks_exact(resampler.input_frames_next());
    for block in &mut blocks {
        let out = resampler.process(&[block], None).map_err(resample_error)?;
        output.extend_from_slice(&out[0]);
    }
    let tail = blocks.remainder();
    if !tail.is_empty() {
        let out = resampler
            .process_partial(Some(&[tail][..]), None)
            .map_err(resample_error)?;
        output.extend_from_slice(&out[0]);
    }

    // push silence until the delayed end of the clip has come out
    while output.len() < delay + wanted {
        let out = resampler
            .process_partial::<&[f64]>(None, None)
            .map_err(resample_error)?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    Ok(output
        .iter()
        .skip(delay)
        .take(wanted)
        .map(|&s| to_pcm16(s))
        .collect())
}

fn resample_error(e: rubato::ResampleError) -> Error {
    Error::Audio(format!("resample failed: {e}"))
}

#[allow(clippy::cast_possible_truncation)]
fn to_pcm16(sample: f64) -> i16 {
    (sample * PCM16_SCALE)
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_block_length() {
        let input: Vec<i16> = (0..1600).map(|i| (i % 100) as i16).collect();
        let output = resample_linear(&input, 24_000, 16_000);
        assert_eq!(output.len(), 1066);
        assert_eq!(output.len(), output_len(1600, 24_000, 16_000));
    }

    #[test]
    fn final_index_clamps_to_last_sample() {
        let input = vec![0, 300, 600, 900];
        let output = resample_linear(&input, 8_000, 16_000);
        assert_eq!(output.len(), 8);
        assert_eq!(*output.last().unwrap(), 900);
    }

    #[test]
    fn ramp_stays_monotonic() {
        let input: Vec<i16> = (0..480).map(|i| i * 10).collect();
        let output = resample_linear(&input, 24_000, 16_000);
        assert!(output.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn interpolates_between_samples() {
        let output = resample_linear(&[0, 100], 1, 2);
        assert_eq!(output, vec![0, 50, 100, 100]);
    }

    #[test]
    fn same_rate_is_identity() {
        assert_eq!(resample_linear(&[1, 2, 3], 16_000, 16_000), vec![1, 2, 3]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(resample_linear(&[], 24_000, 16_000).is_empty());
        assert!(resample_linear(&[1, 2], 0, 16_000).is_empty());
    }

    #[test]
    fn clip_keeps_every_sample_across_blocks() {
        // ten 1152-sample mp3 frames at 44.1 kHz
        let input = vec![1_000i16; 11_520];
        let output = resample_clip(&input, 44_100, 24_000).unwrap();
        assert_eq!(output.len(), 6_269);
        assert!(output[500..6_000].iter().all(|&s| (s - 1_000).abs() <= 30));
    }

    #[test]
    fn clip_upsamples_to_exact_length() {
        let input: Vec<i16> = (0..1_600).map(|i| ((i % 40) * 100) as i16).collect();
        assert_eq!(resample_clip(&input, 16_000, 24_000).unwrap().len(), 2_400);
    }

    #[test]
    fn clip_same_rate_is_identity() {
        assert_eq!(resample_clip(&[4, 5, 6], 24_000, 24_000).unwrap(), vec![4, 5, 6]);
        assert!(resample_clip(&[], 44_100, 24_000).unwrap().is_empty());
    }
}
