//! Response audio decoders
//!
//! Every decoder turns one backend payload into 24 kHz mono PCM16LE ready for
//! the playback session.

use std::io::Cursor;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::audio::PLAYBACK_SAMPLE_RATE;
use crate::audio::pcm::{BYTES_PER_SAMPLE, samples_to_bytes};
use crate::audio::resample::resample_clip;
use crate::protocol::ProtocolError;

/// Frame lengths from this value up use a two-byte header
const TWO_BYTE_HEADER_FROM: u8 = 252;

/// Converts a response payload into playback PCM
#[async_trait]
pub trait PayloadDecoder: Send + Sync {
    /// Decode one payload
    ///
    /// # Errors
    ///
    /// Returns `Decode` or `FrameOverrun` when the payload is unusable
    async fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

/// Payload already is PCM16LE at the playback rate
#[derive(Debug, Default, Clone, Copy)]
pub struct Pcm16Decoder;

#[async_trait]
impl PayloadDecoder for Pcm16Decoder {
    async fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if payload.len() % BYTES_PER_SAMPLE != 0 {
            return Err(ProtocolError::Decode(format!(
                "pcm payload has odd length {}",
                payload.len()
            )));
        }
        Ok(payload.to_vec())
    }
}

/// MP3 payload, down-mixed to mono and resampled to the playback rate
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp3Decoder;

#[async_trait]
impl PayloadDecoder for Mp3Decoder {
    async fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut decoder = minimp3::Decoder::new(Cursor::new(payload));
        let mut runs = RateRuns::default();

        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    let channels = frame.channels.max(1);
                    let mono: Vec<i16> = frame
                        .data
                        .chunks(channels)
                        .map(|pair| match pair {
                            [left, right, ..] => midpoint(*left, *right),
                            [only] => *only,
                            [] => 0,
                        })
                        .collect();

                    let rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);
                    runs.push(rate, &mono)?;
                }
                Err(minimp3::Error::Eof) => break,
                // tags and padding between frames
                Err(minimp3::Error::SkippedData) => continue,
                Err(e) => return Err(ProtocolError::Decode(format!("mp3 decode error: {e}"))),
            }
            tokio::task::yield_now().await;
        }

        let samples = runs.finish()?;
        if samples.is_empty() {
            return Err(ProtocolError::Decode("mp3 payload has no frames".to_string()));
        }
        Ok(samples_to_bytes(&samples))
    }
}

/// Decoded frames grouped into runs of one source rate
///
/// Each run is resampled to the playback rate in one pass.
#[derive(Default)]
struct RateRuns {
    rate: u32,
    pending: Vec<i16>,
    out: Vec<i16>,
}

impl RateRuns {
    fn push(&mut self, rate: u32, samples: &[i16]) -> Result<(), ProtocolError> {
        if rate != self.rate && !self.pending.is_empty() {
            self.flush()?;
        }
        self.rate = rate;
        self.pending.extend_from_slice(samples);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ProtocolError> {
        let run = std::mem::take(&mut self.pending);
        let resampled = resample_clip(&run, self.rate, PLAYBACK_SAMPLE_RATE)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        self.out.extend(resampled);
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<i16>, ProtocolError> {
        if !self.pending.is_empty() {
            self.flush()?;
        }
        Ok(self.out)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn midpoint(left: i16, right: i16) -> i16 {
    ((i32::from(left) + i32::from(right)) / 2) as i16
}

/// Codec for one length-prefixed frame (e.g. Opus)
pub trait FrameDecoder: Send {
    /// Decode one frame into playback-rate samples
    ///
    /// # Errors
    ///
    /// Returns a description of why the frame was rejected
    fn decode_frame(&mut self, frame: &[u8]) -> Result<Vec<i16>, String>;
}

/// Payload holding self-delimited frames back to back
pub struct SelfDelimitedDecoder<F> {
    frames: Mutex<F>,
}

impl<F: FrameDecoder> SelfDelimitedDecoder<F> {
    pub const fn new(frame_decoder: F) -> Self {
        Self {
            frames: Mutex::new(frame_decoder),
        }
    }
}

#[async_trait]
impl<F: FrameDecoder> PayloadDecoder for SelfDelimitedDecoder<F> {
    async fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let frames = split_self_delimited(payload)?;
        let mut out = Vec::new();

        for (i, frame) in frames.into_iter().enumerate() {
            let samples = self
                .frames
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .decode_frame(frame)
                .map_err(|e| ProtocolError::Decode(format!("frame {i}: {e}")))?;
            out.extend(samples_to_bytes(&samples));
            tokio::task::yield_now().await;
        }
        Ok(out)
    }
}

/// Split a payload into its self-delimited frames
///
/// A length below 252 is a single header byte; otherwise the length is
/// `252 + second byte`.
///
/// # Errors
///
/// Returns `FrameOverrun` if a header is truncated or declares more bytes
/// than remain
pub fn split_self_delimited(payload: &[u8]) -> Result<Vec<&[u8]>, ProtocolError> {
    let mut frames = Vec::new();
    let mut rest = payload;

    while let Some((&first, tail)) = rest.split_first() {
        let (len, body) = if first < TWO_BYTE_HEADER_FROM {
            (usize::from(first), tail)
        } else {
            let (&second, body) = tail.split_first().ok_or_else(|| {
                ProtocolError::FrameOverrun(format!(
                    "truncated header at offset {}",
                    payload.len() - rest.len()
                ))
            })?;
            (usize::from(TWO_BYTE_HEADER_FROM) + usize::from(second), body)
        };

        if len > body.len() {
            return Err(ProtocolError::FrameOverrun(format!(
                "frame declares {len} bytes, {} remain",
                body.len()
            )));
        }

        let (frame, next) = body.split_at(len);
        frames.push(frame);
        rest = next;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each frame byte becomes one sample of that value
    struct ByteFrames;

    impl FrameDecoder for ByteFrames {
        fn decode_frame(&mut self, frame: &[u8]) -> Result<Vec<i16>, String> {
            if frame.is_empty() {
                return Err("empty frame".to_string());
            }
            Ok(frame.iter().map(|&b| i16::from(b)).collect())
        }
    }

    #[test]
    fn splits_short_frames() {
        let payload = [2, 10, 11, 1, 20];
        let frames = split_self_delimited(&payload).unwrap();
        assert_eq!(frames, vec![&[10u8, 11][..], &[20u8][..]]);
    }

    #[test]
    fn splits_long_frame() {
        let mut payload = vec![252, 3];
        payload.extend(vec![7u8; 255]);
        let frames = split_self_delimited(&payload).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 255);
    }

    #[test]
    fn overrun_is_rejected() {
        assert!(matches!(
            split_self_delimited(&[5, 1, 2]),
            Err(ProtocolError::FrameOverrun(_))
        ));
        assert!(matches!(
            split_self_delimited(&[3, 1, 2, 3, 253]),
            Err(ProtocolError::FrameOverrun(_))
        ));
    }

    #[test]
    fn empty_payload_has_no_frames() {
        assert!(split_self_delimited(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn pcm_passthrough() {
        assert_eq!(Pcm16Decoder.decode(&[1, 2, 3, 4]).await.unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            Pcm16Decoder.decode(&[1, 2, 3]).await,
            Err(ProtocolError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn self_delimited_drives_frame_decoder() {
        let decoder = SelfDelimitedDecoder::new(ByteFrames);
        let pcm = decoder.decode(&[2, 1, 2, 1, 3]).await.unwrap();
        assert_eq!(pcm, samples_to_bytes(&[1, 2, 3]));

        assert!(matches!(
            decoder.decode(&[0]).await,
            Err(ProtocolError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn garbage_mp3_is_rejected() {
        assert!(Mp3Decoder.decode(b"definitely not mpeg audio").await.is_err());
    }

    #[test]
    fn mp3_frames_resample_as_one_run() {
        let mut runs = RateRuns::default();
        for _ in 0..10 {
            runs.push(44_100, &[800; 1152]).unwrap();
        }
        // per-frame resampling would give 10 * 626
        assert_eq!(runs.finish().unwrap().len(), 6_269);
    }

    #[test]
    fn rate_change_starts_a_new_run() {
        let mut runs = RateRuns::default();
        runs.push(24_000, &[1; 100]).unwrap();
        runs.push(48_000, &[2; 200]).unwrap();
        let out = runs.finish().unwrap();
        assert_eq!(out.len(), 200);
        assert!(out[..100].iter().all(|&s| s == 1));
    }
}
