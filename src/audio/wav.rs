//! WAV encoding and decoding for diagnostics

use std::io::Cursor;

use crate::audio::pcm::f32_to_pcm16;
use crate::audio::resample::resample_clip;
use crate::{Error, Result};

/// Encode mono PCM16 samples as WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode WAV bytes into mono PCM16 at `target_rate`
///
/// Multi-channel input is averaged down to mono; float input is converted.
///
/// # Errors
///
/// Returns error if the WAV data is invalid or uses an unsupported format
pub fn wav_to_pcm16(wav: &[u8], target_rate: u32) -> Result<Vec<i16>> {
    let mut reader =
        hound::WavReader::new(Cursor::new(wav)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(f32_to_pcm16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        (format, bits) => {
            return Err(Error::Audio(format!(
                "unsupported WAV format: {format:?} {bits}-bit"
            )));
        }
    };

    let mono: Vec<i16> = interleaved
        .chunks(channels)
        .map(average)
        .collect();

    resample_clip(&mono, spec.sample_rate, target_rate)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn average(frame: &[i16]) -> i16 {
    let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
    (sum / frame.len() as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_magic() {
        let wav = samples_to_wav(&[0, 1000, -1000], 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > 44);
    }

    #[test]
    fn wav_decodes_at_native_rate() {
        let samples = vec![0, 500, -500, 1000, -1000, 250];
        let wav = samples_to_wav(&samples, 24_000).unwrap();
        assert_eq!(wav_to_pcm16(&wav, 24_000).unwrap(), samples);
    }

    #[test]
    fn wav_is_resampled_to_target_rate() {
        let samples = vec![0i16; 1600];
        let wav = samples_to_wav(&samples, 16_000).unwrap();
        assert_eq!(wav_to_pcm16(&wav, 24_000).unwrap().len(), 2400);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(wav_to_pcm16(b"not a wav file", 24_000).is_err());
    }
}
