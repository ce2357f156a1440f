//! Speaker playback session
//!
//! Two mutually exclusive modes share one speaker:
//! - one-shot: a complete buffer is scaled and drained in a single pass
//! - streaming: writes land in a bounded channel and a drain task feeds the
//!   speaker once the pre-buffer threshold is reached
//!
//! Every block is mirrored to the echo reference before it is written.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::pcm::{MAX_VOLUME, apply_volume};
use crate::audio::{
    BoundedByteChannel, OverflowPolicy, PLAYBACK_SAMPLE_RATE, ReferenceAligner, SendOutcome,
};
use crate::{Error, Result};

/// Sink for 24 kHz mono PCM16LE audio
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Write a block, suspending while the device is saturated
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects the write
    async fn write(&self, pcm: &[u8]) -> Result<()>;
}

/// Playback session settings
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Streaming channel capacity in bytes (2 s at 24 kHz)
    pub channel_capacity: usize,
    /// Bytes buffered before streaming output begins (500 ms)
    pub prebuffer_bytes: usize,
    /// Bytes per speaker write (100 ms)
    pub read_size: usize,
    /// Longest a streaming write may wait for space
    pub write_timeout: Duration,
    /// Longest `stream_end` waits for the channel to drain
    pub drain_timeout: Duration,
    /// Polling interval of the drain loop
    pub poll_interval: Duration,
    /// Initial volume, 0..=100
    pub volume: u8,
    /// Rate of the audio handed to the speaker
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 96_000,
            prebuffer_bytes: 24_000,
            read_size: 4_800,
            write_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            volume: MAX_VOLUME,
            sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

/// Playback lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio output began
    Started,
    /// All audio reached the speaker
    Completed,
    /// Output failed; the mode was abandoned
    Error(String),
}

/// Handle to the playback session; clones share the same speaker and mode
#[derive(Clone)]
pub struct PlaybackSession {
    inner: Arc<Inner>,
}

struct Inner {
    speaker: Arc<dyn Speaker>,
    reference: Option<Arc<ReferenceAligner>>,
    config: PlaybackConfig,
    volume: AtomicU8,
    mode: Mutex<Mode>,
    next_id: AtomicU64,
    events: mpsc::Sender<PlaybackEvent>,
}

enum Mode {
    Idle,
    OneShot {
        id: u64,
        task: JoinHandle<()>,
    },
    Streaming {
        id: u64,
        stream: Arc<Stream>,
        task: Option<JoinHandle<()>>,
    },
}

struct Stream {
    channel: BoundedByteChannel,
    ended: AtomicBool,
}

/// Pending drain of an ended stream
///
/// Dropped before the drain finished (the waiting caller was cancelled), it
/// aborts the drain task and returns the session to idle.
struct DrainWait<'a> {
    inner: &'a Inner,
    id: u64,
    stream: Arc<Stream>,
    task: Option<JoinHandle<()>>,
}

impl Drop for DrainWait<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.stream.channel.drain_all();
            if self.inner.release(self.id) {
                tracing::debug!("stream end abandoned, drain stopped");
            }
        }
    }
}

impl PlaybackSession {
    /// Create an idle session and the receiver of its events
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero-sized buffers or a pre-buffer
    /// threshold larger than the channel
    pub fn new(
        speaker: Arc<dyn Speaker>,
        reference: Option<Arc<ReferenceAligner>>,
        config: PlaybackConfig,
    ) -> Result<(Self, mpsc::Receiver<PlaybackEvent>)> {
        if config.channel_capacity == 0 || config.read_size == 0 {
            return Err(Error::Config(
                "playback channel capacity and read size must be non-zero".to_string(),
            ));
        }
        if config.prebuffer_bytes > config.channel_capacity {
            return Err(Error::Config(format!(
                "pre-buffer threshold {} exceeds channel capacity {}",
                config.prebuffer_bytes, config.channel_capacity
            )));
        }

        let (events, rx) = mpsc::channel(32);
        let inner = Inner {
            speaker,
            reference,
            volume: AtomicU8::new(config.volume.min(MAX_VOLUME)),
            config,
            mode: Mutex::new(Mode::Idle),
            next_id: AtomicU64::new(1),
            events,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    /// Play a complete buffer
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if another playback mode is running
    pub fn play(&self, mut pcm: Vec<u8>) -> Result<()> {
        let mut mode = self.inner.lock_mode();
        if !matches!(*mode, Mode::Idle) {
            return Err(Error::AlreadyActive);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            tracing::debug!(bytes = pcm.len(), "one-shot playback started");
            inner.emit(PlaybackEvent::Started).await;

            apply_volume(&mut pcm, inner.volume());
            for block in pcm.chunks(inner.config.read_size) {
                if let Err(e) = inner.output(block).await {
                    inner.fail(id, &e).await;
                    return;
                }
            }

            if inner.release(id) {
                tracing::debug!("one-shot playback complete");
                inner.emit(PlaybackEvent::Completed).await;
            }
        });

        *mode = Mode::OneShot { id, task };
        Ok(())
    }

    /// Open a streaming playback
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if another playback mode is running
    pub fn stream_start(&self) -> Result<()> {
        let mut mode = self.inner.lock_mode();
        if !matches!(*mode, Mode::Idle) {
            return Err(Error::AlreadyActive);
        }

        let stream = Arc::new(Stream {
            channel: BoundedByteChannel::new(
                self.inner.config.channel_capacity,
                OverflowPolicy::BlockWithTimeout,
            )?,
            ended: AtomicBool::new(false),
        });

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(Arc::clone(&self.inner).drain(id, Arc::clone(&stream)));

        tracing::debug!(
            capacity = self.inner.config.channel_capacity,
            prebuffer = self.inner.config.prebuffer_bytes,
            "stream playback opened"
        );
        *mode = Mode::Streaming {
            id,
            stream,
            task: Some(task),
        };
        Ok(())
    }

    /// Queue audio on the open stream, blocking while the channel is full
    ///
    /// # Errors
    ///
    /// Returns `NotActive` without an open stream, or a playback error if
    /// the channel stays full past the write timeout
    pub async fn stream_write(&self, pcm: &[u8]) -> Result<()> {
        let stream = {
            let mode = self.inner.lock_mode();
            match &*mode {
                Mode::Streaming { stream, .. } if !stream.ended.load(Ordering::Acquire) => {
                    Arc::clone(stream)
                }
                _ => return Err(Error::NotActive),
            }
        };

        for piece in pcm.chunks(stream.channel.capacity()) {
            match stream
                .channel
                .send(piece, self.inner.config.write_timeout)
                .await
            {
                SendOutcome::Sent => {}
                SendOutcome::TimedOut => {
                    return Err(Error::Playback("stream write timed out".to_string()));
                }
                SendOutcome::Dropped => {
                    return Err(Error::Playback("stream write dropped".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Mark end of input and wait for the stream to drain
    ///
    /// Without an open stream this is a no-op. If draining outlasts the drain
    /// timeout the drain task is terminated and whatever remains is dropped.
    pub async fn stream_end(&self) {
        let (id, stream, task) = {
            let mut mode = self.inner.lock_mode();
            match &mut *mode {
                Mode::Streaming { id, stream, task } => match task.take() {
                    Some(task) => (*id, Arc::clone(stream), task),
                    None => return,
                },
                _ => return,
            }
        };

        stream.ended.store(true, Ordering::Release);
        let mut wait = DrainWait {
            inner: &self.inner,
            id,
            stream,
            task: Some(task),
        };
        if let Some(task) = wait.task.as_mut() {
            if tokio::time::timeout(self.inner.config.drain_timeout, &mut *task)
                .await
                .is_err()
            {
                task.abort();
                let dropped = wait.stream.channel.drain_all();
                tracing::warn!(dropped, "stream drain timed out, forcing stop");
            }
        }
        wait.task = None;
        drop(wait);

        if self.inner.release(id) {
            tracing::debug!("stream playback complete");
            self.inner.emit(PlaybackEvent::Completed).await;
        }
    }

    /// Interrupt whichever mode is active without reporting completion
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_mode(), Mode::Idle);
        match previous {
            Mode::Idle => return,
            Mode::OneShot { task, .. } => task.abort(),
            Mode::Streaming { stream, task, .. } => {
                if let Some(task) = task {
                    task.abort();
                }
                stream.ended.store(true, Ordering::Release);
                stream.channel.drain_all();
            }
        }

        if let Some(reference) = &self.inner.reference {
            reference.reset();
        }
        tracing::debug!("playback interrupted");
    }

    /// Set output volume (clamped to 0..=100)
    pub fn set_volume(&self, volume: u8) {
        let volume = volume.min(MAX_VOLUME);
        self.inner.volume.store(volume, Ordering::Relaxed);
        tracing::debug!(volume, "playback volume set");
    }

    /// Current output volume
    #[must_use]
    pub fn volume(&self) -> u8 {
        self.inner.volume()
    }

    /// Whether a streaming playback is open
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(*self.inner.lock_mode(), Mode::Streaming { .. })
    }

    /// Whether any playback mode is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(*self.inner.lock_mode(), Mode::Idle)
    }

    /// Bytes waiting in the streaming channel
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        match &*self.inner.lock_mode() {
            Mode::Streaming { stream, .. } => stream.channel.occupied_bytes(),
            _ => 0,
        }
    }
}

impl Inner {
    fn lock_mode(&self) -> MutexGuard<'_, Mode> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn mode_id(mode: &Mode) -> Option<u64> {
        match mode {
            Mode::Idle => None,
            Mode::OneShot { id, .. } | Mode::Streaming { id, .. } => Some(*id),
        }
    }

    /// Return to idle if mode `id` is still current
    fn release(&self, id: u64) -> bool {
        let mut mode = self.lock_mode();
        if Self::mode_id(&mode) == Some(id) {
            *mode = Mode::Idle;
            true
        } else {
            false
        }
    }

    async fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("playback event receiver dropped");
        }
    }

    async fn fail(&self, id: u64, error: &Error) {
        tracing::error!(error = %error, "playback failed");
        if self.release(id) {
            if let Some(reference) = &self.reference {
                reference.reset();
            }
            self.emit(PlaybackEvent::Error(error.to_string())).await;
        }
    }

    async fn output(&self, block: &[u8]) -> Result<()> {
        if let Some(reference) = &self.reference {
            reference.feed_bytes(block, self.config.sample_rate);
        }
        self.speaker.write(block).await
    }

    async fn drain(self: Arc<Self>, id: u64, stream: Arc<Stream>) {
        let threshold = self.config.prebuffer_bytes.max(1);
        let poll = self.config.poll_interval;

        while !stream.ended.load(Ordering::Acquire)
            && !stream.channel.wait_for_occupied(threshold, poll).await
        {}

        if stream.channel.occupied_bytes() == 0 {
            tracing::debug!("stream ended before any audio arrived");
            return;
        }

        tracing::debug!(
            buffered = stream.channel.occupied_bytes(),
            "pre-buffer reached, starting output"
        );
        self.emit(PlaybackEvent::Started).await;

        loop {
            let ended = stream.ended.load(Ordering::Acquire);
            let mut block = stream.channel.receive_upto(self.config.read_size, poll).await;
            if block.is_empty() {
                if ended {
                    return;
                }
                continue;
            }

            apply_volume(&mut block, self.volume());
            if let Err(e) = self.output(&block).await {
                stream.channel.drain_all();
                self.fail(id, &e).await;
                return;
            }
        }
    }
}
