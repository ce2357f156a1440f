//! Hardware microphone and speaker backed by cpal
//!
//! cpal streams are not `Send`, so each one lives on a dedicated thread that
//! owns it until the adapter is dropped. Device callbacks only touch bounded
//! byte channels through their non-blocking operations.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig, SupportedStreamConfigRange};

use crate::audio::pcm::{BYTES_PER_SAMPLE, bytes_to_samples, f32_to_pcm16, pcm16_to_f32};
use crate::audio::{
    BoundedByteChannel, CAPTURE_SAMPLE_RATE, OverflowPolicy, PLAYBACK_SAMPLE_RATE, SendOutcome,
};
use crate::voice::capture::Microphone;
use crate::voice::playback::Speaker;
use crate::{Error, Result};

/// Microphone buffer (1 s at 16 kHz)
const MIC_BUFFER_BYTES: usize = 32_000;

/// Speaker buffer (200 ms at 24 kHz); small so writes pace with the device
const SPEAKER_BUFFER_BYTES: usize = 9_600;

/// Hardware read timeout, bounds how long a stop request waits
const MIC_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Default input device at 16 kHz
pub struct CpalMicrophone {
    buffer: Arc<BoundedByteChannel>,
    channels: u16,
    _stream: StreamThread,
}

impl CpalMicrophone {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns error if no input device supports 16 kHz capture
    pub fn open() -> Result<Self> {
        let buffer = Arc::new(BoundedByteChannel::new(
            MIC_BUFFER_BYTES,
            OverflowPolicy::DropNewestOnFull,
        )?);

        let (config, name) = {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
            let ranges: Vec<_> = device
                .supported_input_configs()
                .map_err(|e| Error::Audio(e.to_string()))?
                .collect();
            (
                select_config(&ranges, CAPTURE_SAMPLE_RATE)?,
                device.name().unwrap_or_default(),
            )
        };
        let channels = config.channels;

        tracing::debug!(
            device = name,
            sample_rate = CAPTURE_SAMPLE_RATE,
            channels,
            "audio capture initialized"
        );

        let sink = Arc::clone(&buffer);
        let stream = StreamThread::spawn("beacon-mic", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| Error::Audio("no input device".to_string()))?;
            let width = usize::from(channels.max(1));

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let pcm: Vec<u8> = data
                            .chunks(width)
                            .map(|frame| {
                                #[allow(clippy::cast_precision_loss)]
                                let mean = frame.iter().sum::<f32>() / frame.len() as f32;
                                f32_to_pcm16(mean)
                            })
                            .flat_map(i16::to_le_bytes)
                            .collect();
                        if sink.try_send(&pcm) == SendOutcome::Dropped {
                            tracing::trace!("microphone buffer overrun");
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))
        })?;

        tracing::debug!("audio capture started");
        Ok(Self {
            buffer,
            channels,
            _stream: stream,
        })
    }

    /// Channel count of the underlying device stream
    #[must_use]
    pub const fn device_channels(&self) -> u16 {
        self.channels
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn read(&self, frame: &mut [i16]) -> Result<usize> {
        let bytes = self
            .buffer
            .receive_upto(frame.len() * BYTES_PER_SAMPLE, MIC_READ_TIMEOUT)
            .await;
        let samples = bytes_to_samples(&bytes);
        frame[..samples.len()].copy_from_slice(&samples);
        Ok(samples.len())
    }

    fn discard_pending(&self) {
        let dropped = self.buffer.drain_all();
        if dropped > 0 {
            tracing::trace!(dropped, "discarded stale microphone audio");
        }
    }
}

/// Default output device at 24 kHz
pub struct CpalSpeaker {
    buffer: Arc<BoundedByteChannel>,
    write_timeout: Duration,
    _stream: StreamThread,
}

impl CpalSpeaker {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports 24 kHz playback
    pub fn open() -> Result<Self> {
        let buffer = Arc::new(BoundedByteChannel::new(
            SPEAKER_BUFFER_BYTES,
            OverflowPolicy::BlockWithTimeout,
        )?);

        let (config, name) = {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
            let ranges: Vec<_> = device
                .supported_output_configs()
                .map_err(|e| Error::Audio(e.to_string()))?
                .collect();
            (
                select_config(&ranges, PLAYBACK_SAMPLE_RATE)?,
                device.name().unwrap_or_default(),
            )
        };

        tracing::debug!(
            device = name,
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        let source = Arc::clone(&buffer);
        let stream = StreamThread::spawn("beacon-speaker", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device".to_string()))?;
            let width = usize::from(config.channels.max(1));
            let mut scratch: Vec<u8> = Vec::new();

            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / width;
                        scratch.clear();
                        scratch.resize(frames * BYTES_PER_SAMPLE, 0);
                        // underrun leaves the tail as silence
                        source.try_receive_into(&mut scratch);

                        for (frame, pair) in data
                            .chunks_mut(width)
                            .zip(scratch.chunks_exact(BYTES_PER_SAMPLE))
                        {
                            let sample = pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]]));
                            frame.fill(sample);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))
        })?;

        Ok(Self {
            buffer,
            write_timeout: Duration::from_secs(2),
            _stream: stream,
        })
    }
}

#[async_trait]
impl Speaker for CpalSpeaker {
    async fn write(&self, pcm: &[u8]) -> Result<()> {
        for piece in pcm.chunks(self.buffer.capacity()) {
            if self.buffer.send(piece, self.write_timeout).await != SendOutcome::Sent {
                return Err(Error::Playback("speaker write timed out".to_string()));
            }
        }
        Ok(())
    }
}

/// Prefer a mono config at `rate`, falling back to any channel count
fn select_config(ranges: &[SupportedStreamConfigRange], rate: u32) -> Result<StreamConfig> {
    let supports_rate = |c: &&SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(rate) && c.max_sample_rate() >= SampleRate(rate)
    };

    ranges
        .iter()
        .filter(supports_rate)
        .find(|c| c.channels() == 1)
        .or_else(|| ranges.iter().filter(supports_rate).min_by_key(|c| c.channels()))
        .map(|c| c.clone().with_sample_rate(SampleRate(rate)).config())
        .ok_or_else(|| Error::Audio(format!("no device config supports {rate} Hz")))
}

/// Owns a cpal stream on its own thread until dropped
struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // blocks until the owning adapter drops its sender
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("audio thread exited during start-up".to_string()))??;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("audio thread panicked");
            }
        }
    }
}
