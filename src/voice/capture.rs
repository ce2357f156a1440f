//! Microphone capture session
//!
//! One long-lived loop per session reads hardware frames, accumulates them
//! into fixed windows, optionally cleans each window and emits indexed
//! chunks to a bounded sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::pcm::samples_to_bytes;
use crate::audio::{AudioChunk, ReferenceAligner};
use crate::voice::cleaning::CleaningStrategy;
use crate::{Error, Result};

/// Source of 16 kHz mono PCM16 samples
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Read up to `frame.len()` samples, returning how many were written
    ///
    /// Returning zero is allowed when nothing arrived within the device's
    /// own read timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the device read fails
    async fn read(&self, frame: &mut [i16]) -> Result<usize>;

    /// Discard samples captured before a session starts
    fn discard_pending(&self) {}
}

/// Capture session settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per hardware read
    pub frame_samples: usize,
    /// Samples per emitted chunk unless the cleaner negotiates otherwise
    pub chunk_samples: usize,
    /// Session length after which capture stops on its own
    pub max_duration: Duration,
    /// Pause after a failed hardware read
    pub read_retry_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_samples: 256,
            chunk_samples: 1600,
            max_duration: Duration::from_secs(10),
            read_retry_delay: Duration::from_millis(20),
        }
    }
}

/// Message delivered to the capture sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// An audio chunk, in index order
    Chunk(AudioChunk),
    /// Capture hit its maximum duration; the final chunk was already sent
    AutoStop,
}

/// Periodic microphone acquisition
pub struct CaptureSession {
    microphone: Arc<dyn Microphone>,
    reference: Option<Arc<ReferenceAligner>>,
    config: CaptureConfig,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Create a stopped session reading from `microphone`
    #[must_use]
    pub fn new(microphone: Arc<dyn Microphone>, config: CaptureConfig) -> Self {
        Self {
            microphone,
            reference: None,
            config,
            stop: Arc::new(AtomicBool::new(true)),
            task: None,
        }
    }

    /// Pair captured windows with played audio for echo cancellation
    #[must_use]
    pub fn with_reference(mut self, aligner: Arc<ReferenceAligner>) -> Self {
        self.reference = Some(aligner);
        self
    }

    /// Start the capture loop, emitting events to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if a capture loop is still running or the configured
    /// sizes are zero
    pub fn start(
        &mut self,
        sink: mpsc::Sender<CaptureEvent>,
        cleaning: CleaningStrategy,
    ) -> Result<()> {
        if self.is_running() {
            return Err(Error::Capture("capture already running".to_string()));
        }

        let chunk_samples = cleaning
            .chunk_samples()
            .unwrap_or(self.config.chunk_samples);
        if chunk_samples == 0 || self.config.frame_samples == 0 {
            return Err(Error::Config(
                "capture frame and chunk sizes must be non-zero".to_string(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);

        let capture = CaptureLoop {
            microphone: Arc::clone(&self.microphone),
            reference: self.reference.clone(),
            cleaning,
            frame_samples: self.config.frame_samples,
            chunk_samples,
            max_duration: self.config.max_duration,
            read_retry_delay: self.config.read_retry_delay,
            stop,
            sink,
        };

        tracing::debug!(
            chunk_samples,
            strategy = ?capture.cleaning,
            "capture session started"
        );
        self.task = Some(tokio::spawn(capture.run()));
        Ok(())
    }

    /// Ask the loop to emit its final chunk and exit
    ///
    /// Safe to call any number of times.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!("capture stop requested");
        }
    }

    /// Whether the capture loop is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the capture loop to exit
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "capture task ended abnormally");
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    microphone: Arc<dyn Microphone>,
    reference: Option<Arc<ReferenceAligner>>,
    cleaning: CleaningStrategy,
    frame_samples: usize,
    chunk_samples: usize,
    max_duration: Duration,
    read_retry_delay: Duration,
    stop: Arc<AtomicBool>,
    sink: mpsc::Sender<CaptureEvent>,
}

impl CaptureLoop {
    async fn run(mut self) {
        self.microphone.discard_pending();

        let started = Instant::now();
        let mut frame = vec![0i16; self.frame_samples];
        let mut window: Vec<i16> = Vec::with_capacity(self.chunk_samples);
        let mut index = 0u32;

        loop {
            if self.stop.load(Ordering::Acquire) {
                finish(&self.sink, index, window).await;
                return;
            }

            if started.elapsed() >= self.max_duration {
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis(),
                    "capture reached maximum duration"
                );
                self.stop.store(true, Ordering::Release);
                if finish(&self.sink, index, window).await {
                    let _ = self.sink.send(CaptureEvent::AutoStop).await;
                }
                return;
            }

            match self.microphone.read(&mut frame).await {
                Ok(read) => window.extend_from_slice(&frame[..read.min(frame.len())]),
                Err(e) => {
                    tracing::warn!(error = %e, "microphone read failed, retrying");
                    tokio::time::sleep(self.read_retry_delay).await;
                    continue;
                }
            }

            while window.len() >= self.chunk_samples {
                let rest = window.split_off(self.chunk_samples);
                let full = std::mem::replace(&mut window, rest);
                let cleaned = self.cleaning.clean(full, self.reference.as_deref());

                let chunk = AudioChunk::new(index, samples_to_bytes(&cleaned), false);
                if self.sink.send(CaptureEvent::Chunk(chunk)).await.is_err() {
                    tracing::debug!("capture sink closed, ending session");
                    return;
                }
                index += 1;
            }
        }
    }
}

/// Emit the remainder as the final chunk; false if the sink is gone
async fn finish(sink: &mpsc::Sender<CaptureEvent>, index: u32, remainder: Vec<i16>) -> bool {
    tracing::debug!(
        index,
        samples = remainder.len(),
        "capture stopped, emitting final chunk"
    );
    let chunk = AudioChunk::new(index, samples_to_bytes(&remainder), true);
    sink.send(CaptureEvent::Chunk(chunk)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::audio::pcm::bytes_to_samples;
    use crate::voice::cleaning::EchoCanceller;

    /// Replays fixed frames, then reports nothing
    struct FrameScript {
        frames: Mutex<VecDeque<Result<Vec<i16>>>>,
    }

    impl FrameScript {
        fn new(frames: Vec<Result<Vec<i16>>>) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(frames.into()),
            })
        }
    }

    #[async_trait]
    impl Microphone for FrameScript {
        async fn read(&self, frame: &mut [i16]) -> Result<usize> {
            let next = self.frames.lock().unwrap().pop_front();
            match next {
                Some(Ok(samples)) => {
                    frame[..samples.len()].copy_from_slice(&samples);
                    Ok(samples.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(0)
                }
            }
        }
    }

    fn frames(count: usize, value: i16) -> Vec<Result<Vec<i16>>> {
        (0..count).map(|_| Ok(vec![value; 256])).collect()
    }

    async fn next_chunk(rx: &mut mpsc::Receiver<CaptureEvent>) -> AudioChunk {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(CaptureEvent::Chunk(chunk))) => chunk,
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_window_emitted_and_remainder_retained() {
        let mic = FrameScript::new(frames(10, 5));
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = CaptureSession::new(mic, CaptureConfig::default());
        session.start(tx, CleaningStrategy::Passthrough).unwrap();

        let first = next_chunk(&mut rx).await;
        assert_eq!(first.index, 0);
        assert_eq!(first.samples(), 1600);
        assert!(!first.is_final);

        tokio::time::sleep(Duration::from_millis(30)).await;
        session.stop();

        let last = next_chunk(&mut rx).await;
        assert_eq!(last.index, 1);
        assert_eq!(last.samples(), 960);
        assert!(last.is_final);

        session.join().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_without_audio_emits_empty_final_chunk() {
        let mic = FrameScript::new(Vec::new());
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = CaptureSession::new(mic, CaptureConfig::default());
        session.start(tx, CleaningStrategy::Passthrough).unwrap();

        session.stop();
        session.stop();

        let last = next_chunk(&mut rx).await;
        assert!(last.is_final);
        assert!(last.is_empty());
        session.join().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn max_duration_auto_stops() {
        let mic = FrameScript::new(frames(3, 1));
        let (tx, mut rx) = mpsc::channel(8);
        let config = CaptureConfig {
            max_duration: Duration::from_millis(50),
            ..CaptureConfig::default()
        };
        let mut session = CaptureSession::new(mic, config);
        session.start(tx, CleaningStrategy::Passthrough).unwrap();

        let last = next_chunk(&mut rx).await;
        assert!(last.is_final);
        assert_eq!(last.samples(), 768);
        assert_eq!(rx.recv().await, Some(CaptureEvent::AutoStop));
        session.join().await;
    }

    #[tokio::test]
    async fn read_errors_are_retried() {
        let mut script = vec![Err(Error::Audio("overrun".to_string()))];
        script.extend(frames(7, 2));
        let mic = FrameScript::new(script);
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = CaptureSession::new(mic, CaptureConfig::default());
        session.start(tx, CleaningStrategy::Passthrough).unwrap();

        let first = next_chunk(&mut rx).await;
        assert_eq!(first.samples(), 1600);
        session.stop();
        session.join().await;
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let mic = FrameScript::new(Vec::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut session = CaptureSession::new(mic, CaptureConfig::default());
        session.start(tx.clone(), CleaningStrategy::Passthrough).unwrap();
        assert!(session.start(tx, CleaningStrategy::Passthrough).is_err());
        session.stop();
        session.join().await;
    }

    /// Halves every sample and asks for 512-sample windows
    struct Halve;

    impl EchoCanceller for Halve {
        fn preferred_chunk_samples(&self) -> Option<usize> {
            Some(512)
        }

        fn process(&mut self, mic: &[i16], _reference: &[i16]) -> Result<Vec<i16>> {
            Ok(mic.iter().map(|s| s / 2).collect())
        }
    }

    #[tokio::test]
    async fn active_cleaner_runs_inside_capture_loop() {
        let mic = FrameScript::new(frames(2, 100));
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = CaptureSession::new(mic, CaptureConfig::default());
        session
            .start(tx, CleaningStrategy::Active(Box::new(Halve)))
            .unwrap();

        let first = next_chunk(&mut rx).await;
        assert_eq!(first.samples(), 512);
        assert!(bytes_to_samples(&first.data).iter().all(|&s| s == 50));

        session.stop();
        let last = next_chunk(&mut rx).await;
        assert!(last.is_final);
        assert_eq!(last.index, 1);
        session.join().await;
    }
}
