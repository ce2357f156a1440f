//! Session-scoped streaming client
//!
//! Each session owns two long-lived tasks: an uploader that sends chunks in
//! index order and a receiver that turns inbound frames into playback. The
//! first of them to reach a verdict resolves the session; the verdict is
//! reported once on the report channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::AudioChunk;
use crate::protocol::codec::PayloadDecoder;
use crate::protocol::transport::{Downlink, InboundFrame, Transport, Uplink};
use crate::protocol::{ProtocolConfig, ProtocolError};
use crate::voice::PlaybackSession;

/// Close codes treated as a normal end of the reply
const NORMAL_CLOSE_CODES: [u16; 2] = [1000, 1005];

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Reply received and handed to playback
    Completed,
    /// Transient failure; the exchange may be re-attempted
    Retry(ProtocolError),
    /// Terminal failure
    Failed(ProtocolError),
}

impl SessionOutcome {
    /// Classify a protocol error
    #[must_use]
    pub fn from_error(error: ProtocolError) -> Self {
        if error.is_retryable() {
            Self::Retry(error)
        } else {
            Self::Failed(error)
        }
    }
}

/// Identifies one session of this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    seq: u64,
    id: Arc<str>,
}

impl SessionHandle {
    /// Opaque session identifier sent to the backend
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Monotonic sequence number, unique per `begin_session`
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

/// Verdict for one session
#[derive(Debug)]
pub struct SessionReport {
    pub handle: SessionHandle,
    pub outcome: SessionOutcome,
}

struct SessionShared {
    handle: SessionHandle,
    final_sent: OnceLock<Instant>,
    resolved: AtomicBool,
    reports: mpsc::Sender<SessionReport>,
}

impl SessionShared {
    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Report `outcome` unless the session already has a verdict
    async fn resolve(&self, outcome: SessionOutcome) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }

        match &outcome {
            SessionOutcome::Completed => {
                tracing::debug!(session_id = self.handle.id(), "session completed");
            }
            SessionOutcome::Retry(e) => {
                tracing::warn!(session_id = self.handle.id(), error = %e, "session failed, retryable");
            }
            SessionOutcome::Failed(e) => {
                tracing::error!(session_id = self.handle.id(), error = %e, "session failed");
            }
        }

        let report = SessionReport {
            handle: self.handle.clone(),
            outcome,
        };
        if self.reports.send(report).await.is_err() {
            tracing::trace!("session report receiver dropped");
        }
    }
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    uploads: mpsc::Sender<AudioChunk>,
    next_index: u32,
    uploader: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// Streams captured chunks to the backend and plays what comes back
pub struct StreamingProtocolClient {
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn PayloadDecoder>,
    playback: PlaybackSession,
    connectivity: watch::Receiver<bool>,
    config: ProtocolConfig,
    reports: mpsc::Sender<SessionReport>,
    next_seq: u64,
    active: Option<ActiveSession>,
}

impl StreamingProtocolClient {
    /// Create a client and the receiver of its session reports
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn PayloadDecoder>,
        playback: PlaybackSession,
        connectivity: watch::Receiver<bool>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::Receiver<SessionReport>) {
        let (reports, rx) = mpsc::channel(8);
        let client = Self {
            transport,
            decoder,
            playback,
            connectivity,
            config,
            reports,
            next_seq: 1,
            active: None,
        };
        (client, rx)
    }

    fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Open a session, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnavailable` while offline, or the transport's
    /// error if the link cannot be opened
    pub async fn begin_session(&mut self, session_id: &str) -> Result<SessionHandle, ProtocolError> {
        if !self.is_online() {
            return Err(ProtocolError::ConnectionUnavailable);
        }
        self.end_session();

        let (uplink, downlink) = self.transport.open(session_id).await?;

        let handle = SessionHandle {
            seq: self.next_seq,
            id: Arc::from(session_id),
        };
        self.next_seq += 1;

        let shared = Arc::new(SessionShared {
            handle: handle.clone(),
            final_sent: OnceLock::new(),
            resolved: AtomicBool::new(false),
            reports: self.reports.clone(),
        });

        let (uploads, queue) = mpsc::channel(self.config.upload_queue.max(1));
        let uploader = tokio::spawn(upload(Arc::clone(&shared), uplink, queue));
        let receiver = tokio::spawn(
            Receiver {
                shared: Arc::clone(&shared),
                downlink,
                decoder: Arc::clone(&self.decoder),
                playback: self.playback.clone(),
                config: self.config.clone(),
                streamed: 0,
                idle_checks: 0,
            }
            .run(),
        );

        tracing::info!(session_id, seq = handle.seq, "session started");
        self.active = Some(ActiveSession {
            shared,
            uploads,
            next_index: 0,
            uploader,
            receiver,
        });
        Ok(handle)
    }

    /// Queue one chunk for upload
    ///
    /// Waits while the upload queue is full. The final chunk arms response
    /// handling.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnavailable` while offline or without a live
    /// session, and `OutOfOrder` if the index does not follow the last one
    pub async fn send_chunk(&mut self, chunk: AudioChunk) -> Result<(), ProtocolError> {
        if !self.is_online() {
            return Err(ProtocolError::ConnectionUnavailable);
        }
        let session = self
            .active
            .as_mut()
            .filter(|s| !s.shared.is_resolved())
            .ok_or(ProtocolError::ConnectionUnavailable)?;

        if chunk.index != session.next_index {
            return Err(ProtocolError::OutOfOrder {
                expected: session.next_index,
                got: chunk.index,
            });
        }

        let index = chunk.index;
        let is_final = chunk.is_final;
        session
            .uploads
            .send(chunk)
            .await
            .map_err(|_| ProtocolError::ConnectionUnavailable)?;
        session.next_index += 1;

        tracing::trace!(index, is_final, "chunk queued");
        Ok(())
    }

    /// Drop the live session without reporting an outcome
    pub fn end_session(&mut self) {
        if let Some(session) = self.active.take() {
            session.shared.resolved.store(true, Ordering::Release);
            session.uploader.abort();
            session.receiver.abort();
            tracing::debug!(session_id = session.shared.handle.id(), "session ended");
        }
    }

    /// Handle of the live session, if any
    #[must_use]
    pub fn active_session(&self) -> Option<&SessionHandle> {
        self.active.as_ref().map(|s| &s.shared.handle)
    }

    /// Whether a session is open and unresolved
    #[must_use]
    pub fn is_session_active(&self) -> bool {
        self.active.as_ref().is_some_and(|s| !s.shared.is_resolved())
    }
}

impl Drop for StreamingProtocolClient {
    fn drop(&mut self) {
        self.end_session();
    }
}

async fn upload(
    shared: Arc<SessionShared>,
    mut uplink: Box<dyn Uplink>,
    mut queue: mpsc::Receiver<AudioChunk>,
) {
    while let Some(chunk) = queue.recv().await {
        if chunk.is_final {
            let _ = shared.final_sent.set(Instant::now());
        }

        if let Err(e) = uplink.send(&chunk).await {
            tracing::warn!(index = chunk.index, error = %e, "chunk upload failed");
            shared.resolve(SessionOutcome::from_error(e)).await;
            return;
        }

        if chunk.is_final {
            tracing::debug!(chunks = chunk.index + 1, "upload complete");
            return;
        }
    }
}

struct Receiver {
    shared: Arc<SessionShared>,
    downlink: Box<dyn Downlink>,
    decoder: Arc<dyn PayloadDecoder>,
    playback: PlaybackSession,
    config: ProtocolConfig,
    streamed: usize,
    idle_checks: u32,
}

impl Receiver {
    async fn run(mut self) {
        let outcome = match self.receive().await {
            Ok(()) => SessionOutcome::Completed,
            Err(e) => SessionOutcome::from_error(e),
        };
        self.shared.resolve(outcome).await;
    }

    async fn receive(&mut self) -> Result<(), ProtocolError> {
        loop {
            if self.shared.is_resolved() {
                return Ok(());
            }

            let frame = self
                .downlink
                .next_frame(self.config.idle_check_interval)
                .await?;

            match frame {
                None => {
                    if self.reply_idle()? {
                        tracing::debug!(bytes = self.streamed, "reply idle, finishing");
                        return self.finish_stream().await;
                    }
                }
                Some(InboundFrame::AudioDelta(data)) => self.write_delta(&data).await?,
                Some(InboundFrame::Payload(data)) => return self.play_payload(&data).await,
                Some(InboundFrame::Complete) => return self.finish_stream().await,
                Some(InboundFrame::Closed { code, reason }) => {
                    if NORMAL_CLOSE_CODES.contains(&code) {
                        return self.finish_stream().await;
                    }
                    return Err(ProtocolError::Closed { code, reason });
                }
                Some(InboundFrame::SpeechStart) => tracing::debug!("backend heard speech start"),
                Some(InboundFrame::SpeechEnd) => tracing::debug!("backend heard speech end"),
            }
        }
    }

    /// Count an empty check; true once the reply has gone quiet
    fn reply_idle(&mut self) -> Result<bool, ProtocolError> {
        let Some(sent) = self.shared.final_sent.get() else {
            return Ok(false);
        };

        if self.streamed > 0 {
            self.idle_checks += 1;
            return Ok(self.idle_checks >= self.config.idle_checks);
        }

        if sent.elapsed() >= self.config.response_timeout {
            return Err(ProtocolError::ResponseTimeout(self.config.response_timeout));
        }
        Ok(false)
    }

    async fn write_delta(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let pcm = self.decoder.decode(data).await?;
        if pcm.is_empty() {
            return Ok(());
        }

        if !self.playback.is_streaming() {
            self.playback.stream_start().map_err(playback_error)?;
        }
        self.playback
            .stream_write(&pcm)
            .await
            .map_err(playback_error)?;

        self.streamed += pcm.len();
        self.idle_checks = 0;
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn play_payload(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let pcm = self.decoder.decode(data).await?;
        if pcm.is_empty() {
            return Err(ProtocolError::NoAudio);
        }
        tracing::debug!(bytes = pcm.len(), "reply decoded");

        if self.playback.is_streaming() {
            self.playback
                .stream_write(&pcm)
                .await
                .map_err(playback_error)?;
            self.streamed += pcm.len();
            self.playback.stream_end().await;
            Ok(())
        } else {
            self.playback.play(pcm).map_err(playback_error)
        }
    }

    async fn finish_stream(&mut self) -> Result<(), ProtocolError> {
        if self.streamed == 0 {
            return Err(ProtocolError::NoAudio);
        }
        self.playback.stream_end().await;
        Ok(())
    }
}

fn playback_error(e: crate::Error) -> ProtocolError {
    ProtocolError::Playback(e.to_string())
}
