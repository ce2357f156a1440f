//! Assistant state machine
//!
//! A single actor task owns the capture session, the protocol client and the
//! playback session. Intents from the UI, capture events, session reports,
//! playback events and connectivity changes are all handled on that task, so
//! the state has exactly one writer. Every change is published as a full
//! [`AssistantStatus`] snapshot on a watch channel.

mod identity;
mod status;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use identity::{FileIdentity, SessionIdentity, StaticIdentity, default_identity_path};
pub use status::{AssistantState, AssistantStatus};

use crate::audio::AudioChunk;
use crate::protocol::retry::delay_for_attempt;
use crate::protocol::{
    ProtocolError, RetryPolicy, SessionHandle, SessionOutcome, SessionReport,
    StreamingProtocolClient,
};
use crate::voice::{CaptureEvent, CaptureSession, CleaningStrategy, PlaybackEvent, PlaybackSession};
use crate::{Error, Result};

/// How an exchange is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssistantVariant {
    /// Record an utterance, upload it, then play the reply
    #[default]
    Discrete,
    /// Persistent session; replies stream while capture continues
    Continuous,
}

impl std::str::FromStr for AssistantVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discrete" => Ok(Self::Discrete),
            "continuous" => Ok(Self::Continuous),
            other => Err(Error::Config(format!("unknown assistant variant: {other}"))),
        }
    }
}

impl std::fmt::Display for AssistantVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discrete => write!(f, "discrete"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// User request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
    /// Start when idle, stop while capturing, interrupt otherwise
    Toggle,
    /// Abandon the exchange and silence playback
    Cancel,
    SetVolume(u8),
}

/// Builds the cleaning strategy for each new capture
pub type CleaningFactory = Box<dyn Fn() -> CleaningStrategy + Send + Sync>;

/// Assistant settings
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub variant: AssistantVariant,
    pub retry: RetryPolicy,
    /// Capture events buffered ahead of the actor
    pub capture_queue: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            variant: AssistantVariant::Discrete,
            retry: RetryPolicy::default(),
            capture_queue: 32,
        }
    }
}

/// Everything the assistant drives
pub struct Components {
    pub capture: CaptureSession,
    pub playback: PlaybackSession,
    pub playback_events: mpsc::Receiver<PlaybackEvent>,
    pub client: StreamingProtocolClient,
    pub session_reports: mpsc::Receiver<SessionReport>,
    pub connectivity: watch::Receiver<bool>,
    pub identity: Arc<dyn SessionIdentity>,
    pub cleaning: CleaningFactory,
}

struct Command {
    intent: Intent,
    reply: oneshot::Sender<AssistantStatus>,
}

/// Handle to the running assistant
pub struct Assistant {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<AssistantStatus>,
    task: JoinHandle<()>,
}

impl Assistant {
    /// Spawn the state machine task
    #[must_use]
    pub fn spawn(components: Components, config: AssistantConfig) -> Self {
        let connected = *components.connectivity.borrow();
        let (status_tx, status) = watch::channel(AssistantStatus {
            state: AssistantState::Idle,
            connected,
            session_active: false,
        });
        let (commands, rx) = mpsc::channel(16);

        let actor = Actor {
            capture: components.capture,
            capture_events: None,
            playback: components.playback,
            playback_events: components.playback_events,
            client: components.client,
            session_reports: components.session_reports,
            connectivity: components.connectivity,
            identity: components.identity,
            cleaning: components.cleaning,
            config,
            state: AssistantState::Idle,
            status: status_tx,
            exchange: None,
            exchange_seq: 0,
        };

        tracing::info!(variant = %actor.config.variant, "assistant started");
        Self {
            commands,
            status,
            task: tokio::spawn(actor.run(rx)),
        }
    }

    /// Submit an intent and wait for the status it produced
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the assistant task has exited
    pub async fn request(&self, intent: Intent) -> Result<AssistantStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { intent, reply })
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    /// # Errors
    ///
    /// Returns `NotRunning` if the assistant task has exited
    pub async fn start(&self) -> Result<AssistantStatus> {
        self.request(Intent::Start).await
    }

    /// # Errors
    ///
    /// Returns `NotRunning` if the assistant task has exited
    pub async fn stop(&self) -> Result<AssistantStatus> {
        self.request(Intent::Stop).await
    }

    /// # Errors
    ///
    /// Returns `NotRunning` if the assistant task has exited
    pub async fn toggle(&self) -> Result<AssistantStatus> {
        self.request(Intent::Toggle).await
    }

    /// # Errors
    ///
    /// Returns `NotRunning` if the assistant task has exited
    pub async fn cancel(&self) -> Result<AssistantStatus> {
        self.request(Intent::Cancel).await
    }

    /// # Errors
    ///
    /// Returns `NotRunning` if the assistant task has exited
    pub async fn set_volume(&self, volume: u8) -> Result<AssistantStatus> {
        self.request(Intent::SetVolume(volume)).await
    }

    /// Latest published snapshot
    #[must_use]
    pub fn status(&self) -> AssistantStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AssistantStatus> {
        self.status.clone()
    }

    /// Stop the actor, tearing down any exchange in progress
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "assistant task ended abnormally");
        }
    }
}

/// One user exchange, possibly spanning several protocol sessions
struct Exchange {
    session_id: String,
    /// Every chunk captured so far, kept for replay
    chunks: Vec<AudioChunk>,
    session: Option<SessionHandle>,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl Exchange {
    const fn is_answered(&self) -> bool {
        self.session.is_none() && self.retry_at.is_none()
    }
}

enum Event {
    Command(Option<Command>),
    Capture(Option<CaptureEvent>),
    Report(SessionReport),
    Playback(PlaybackEvent),
    Connectivity,
    RetryDue,
}

struct Actor {
    capture: CaptureSession,
    capture_events: Option<mpsc::Receiver<CaptureEvent>>,
    playback: PlaybackSession,
    playback_events: mpsc::Receiver<PlaybackEvent>,
    client: StreamingProtocolClient,
    session_reports: mpsc::Receiver<SessionReport>,
    connectivity: watch::Receiver<bool>,
    identity: Arc<dyn SessionIdentity>,
    cleaning: CleaningFactory,
    config: AssistantConfig,
    state: AssistantState,
    status: watch::Sender<AssistantStatus>,
    exchange: Option<Exchange>,
    exchange_seq: u64,
}

async fn next_capture(events: &mut Option<mpsc::Receiver<CaptureEvent>>) -> Option<CaptureEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let retry_at = self.exchange.as_ref().and_then(|e| e.retry_at);

            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                event = next_capture(&mut self.capture_events) => Event::Capture(event),
                Some(report) = self.session_reports.recv() => Event::Report(report),
                Some(event) = self.playback_events.recv() => Event::Playback(event),
                Ok(()) = self.connectivity.changed() => Event::Connectivity,
                () = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    Event::RetryDue
                }
            };

            match event {
                Event::Command(None) => break,
                Event::Command(Some(Command { intent, reply })) => {
                    self.handle_intent(intent).await;
                    let _ = reply.send(self.publish());
                    continue;
                }
                Event::Capture(event) => self.on_capture(event).await,
                Event::Report(report) => self.on_report(report),
                Event::Playback(event) => self.on_playback(event),
                Event::Connectivity => {
                    tracing::info!(connected = self.is_connected(), "connectivity changed");
                }
                Event::RetryDue => self.retry_exchange().await,
            }
            self.publish();
        }

        self.reset_pipeline().await;
        self.state = AssistantState::Idle;
        self.publish();
        tracing::info!("assistant stopped");
    }

    fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    fn publish(&self) -> AssistantStatus {
        let snapshot = AssistantStatus {
            state: self.state,
            connected: self.is_connected(),
            session_active: self.client.is_session_active(),
        };
        if status::publish(&self.status, snapshot) {
            tracing::debug!(status = %snapshot, "status changed");
        }
        snapshot
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Start => self.start().await,
            Intent::Stop => self.stop_capture(),
            Intent::Toggle => match self.state {
                AssistantState::Idle | AssistantState::Error => self.start().await,
                AssistantState::Recording | AssistantState::Streaming => self.stop_capture(),
                AssistantState::Sending | AssistantState::Playing => self.cancel().await,
            },
            Intent::Cancel => self.cancel().await,
            Intent::SetVolume(volume) => self.playback.set_volume(volume),
        }
    }

    async fn start(&mut self) {
        if !self.state.can_start() {
            tracing::debug!(state = %self.state, "start ignored");
            return;
        }
        if !self.is_connected() {
            tracing::warn!("offline, start ignored");
            return;
        }

        self.reset_pipeline().await;

        self.exchange_seq += 1;
        let session_id = format!("{}-{:04x}", self.identity.device_id(), self.exchange_seq);
        let handle = match self.client.begin_session(&session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(&format!("session could not be opened: {e}"));
                return;
            }
        };
        self.exchange = Some(Exchange {
            session_id: session_id.clone(),
            chunks: Vec::new(),
            session: Some(handle),
            attempt: 0,
            retry_at: None,
        });

        let continuous = self.config.variant == AssistantVariant::Continuous;
        if continuous {
            if let Err(e) = self.playback.stream_start() {
                self.fail(&format!("playback stream unavailable: {e}"));
                return;
            }
        }

        let (sink, events) = mpsc::channel(self.config.capture_queue.max(1));
        if let Err(e) = self.capture.start(sink, (self.cleaning)()) {
            self.fail(&format!("capture could not start: {e}"));
            return;
        }
        self.capture_events = Some(events);

        self.state = if continuous {
            AssistantState::Streaming
        } else {
            AssistantState::Recording
        };
        tracing::info!(session_id, state = %self.state, "exchange started");
    }

    fn stop_capture(&mut self) {
        if matches!(
            self.state,
            AssistantState::Recording | AssistantState::Streaming
        ) {
            self.capture.stop();
            self.state = AssistantState::Sending;
            tracing::info!("capture stopped, awaiting reply");

            // reply already delivered while capture was still running
            let answered = self.exchange.as_ref().is_some_and(Exchange::is_answered);
            if answered && !self.playback.is_active() {
                self.finish();
            }
        } else {
            tracing::debug!(state = %self.state, "stop ignored");
        }
    }

    async fn cancel(&mut self) {
        if self.state.is_idle() {
            return;
        }
        self.reset_pipeline().await;
        self.state = AssistantState::Idle;
        tracing::info!("exchange cancelled");
    }

    /// Tear down capture, playback and the session
    async fn reset_pipeline(&mut self) {
        self.capture_events = None;
        self.capture.stop();
        self.capture.join().await;
        self.playback.stop();
        self.client.end_session();
        self.exchange = None;
    }

    fn fail(&mut self, reason: &str) {
        tracing::error!(reason, "exchange failed");
        self.capture_events = None;
        self.capture.stop();
        self.playback.stop();
        self.client.end_session();
        self.exchange = None;
        self.state = AssistantState::Error;
    }

    fn finish(&mut self) {
        self.client.end_session();
        self.exchange = None;
        self.state = AssistantState::Idle;
        tracing::info!("exchange complete");
    }

    async fn on_capture(&mut self, event: Option<CaptureEvent>) {
        match event {
            None => self.capture_events = None,
            Some(CaptureEvent::AutoStop) => {
                tracing::info!("capture reached its maximum duration");
                self.stop_capture();
            }
            Some(CaptureEvent::Chunk(chunk)) => self.forward_chunk(chunk).await,
        }
    }

    async fn forward_chunk(&mut self, chunk: AudioChunk) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        exchange.chunks.push(chunk.clone());

        if exchange.session.is_none() {
            if exchange.is_answered()
                && chunk.is_final
                && self.state == AssistantState::Sending
                && !self.playback.is_active()
            {
                self.finish();
            } else {
                tracing::trace!(index = chunk.index, "chunk retained for replay");
            }
            return;
        }

        if let Err(e) = self.client.send_chunk(chunk).await {
            self.on_send_error(e);
        }
    }

    fn on_send_error(&mut self, error: ProtocolError) {
        match error {
            ProtocolError::ConnectionUnavailable => {
                let verdict_pending =
                    self.client.active_session().is_some() && !self.client.is_session_active();
                if self.state == AssistantState::Sending
                    && (!self.is_connected() || !verdict_pending)
                {
                    self.fail("connection unavailable");
                } else {
                    // a session verdict is on its way, or capture continues
                    tracing::warn!(state = %self.state, "chunk not sent, connection unavailable");
                }
            }
            other => self.fail(&other.to_string()),
        }
    }

    fn on_report(&mut self, report: SessionReport) {
        let current = self
            .exchange
            .as_ref()
            .and_then(|e| e.session.as_ref())
            .is_some_and(|handle| *handle == report.handle);
        if !current {
            tracing::debug!(session_id = report.handle.id(), "stale session report ignored");
            return;
        }

        match report.outcome {
            SessionOutcome::Completed => {
                self.client.end_session();
                if let Some(exchange) = self.exchange.as_mut() {
                    exchange.session = None;
                }
                if self.state == AssistantState::Sending && !self.playback.is_active() {
                    self.finish();
                }
            }
            SessionOutcome::Retry(e) => self.schedule_retry(&e),
            SessionOutcome::Failed(e) => self.fail(&e.to_string()),
        }
    }

    fn schedule_retry(&mut self, error: &ProtocolError) {
        if !matches!(
            self.state,
            AssistantState::Recording | AssistantState::Streaming | AssistantState::Sending
        ) {
            self.fail(&error.to_string());
            return;
        }

        // audio from the failed attempt is discarded
        self.client.end_session();
        self.playback.stop();
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        exchange.session = None;

        if !self.config.retry.allows(exchange.attempt) {
            let attempts = exchange.attempt;
            self.fail(&format!("{error} (gave up after {attempts} retries)"));
            return;
        }

        let delay = delay_for_attempt(&self.config.retry, exchange.attempt, error.retry_after());
        exchange.attempt += 1;
        exchange.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            attempt = exchange.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "exchange will be retried"
        );
    }

    async fn retry_exchange(&mut self) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        exchange.retry_at = None;
        let session_id = exchange.session_id.clone();

        if !self.is_connected() {
            self.fail("connection unavailable");
            return;
        }

        if self.config.variant == AssistantVariant::Continuous {
            if let Err(e) = self.playback.stream_start() {
                self.fail(&format!("playback stream unavailable: {e}"));
                return;
            }
        }

        let handle = match self.client.begin_session(&session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                match SessionOutcome::from_error(e) {
                    SessionOutcome::Retry(e) => self.schedule_retry(&e),
                    SessionOutcome::Failed(e) => self.fail(&e.to_string()),
                    SessionOutcome::Completed => {}
                }
                return;
            }
        };

        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        exchange.session = Some(handle);
        let chunks = exchange.chunks.clone();
        tracing::info!(
            session_id,
            attempt = exchange.attempt,
            chunks = chunks.len(),
            "replaying exchange"
        );

        for chunk in chunks {
            if let Err(e) = self.client.send_chunk(chunk).await {
                self.on_send_error(e);
                return;
            }
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started => {
                if self.state == AssistantState::Sending {
                    self.state = AssistantState::Playing;
                }
            }
            PlaybackEvent::Completed => {
                if matches!(
                    self.state,
                    AssistantState::Playing | AssistantState::Sending
                ) {
                    self.finish();
                }
            }
            PlaybackEvent::Error(message) => {
                if self.state == AssistantState::Playing {
                    self.fail(&format!("playback failed: {message}"));
                } else {
                    tracing::warn!(error = %message, state = %self.state, "playback error");
                }
            }
        }
    }
}
