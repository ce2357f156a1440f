//! Shared test utilities
//!
//! Fakes for the microphone, speaker and backend so the pipeline runs
//! without audio hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use beacon_endpoint::assistant::{
    Assistant, AssistantConfig, AssistantState, AssistantStatus, Components, StaticIdentity,
};
use beacon_endpoint::audio::AudioChunk;
use beacon_endpoint::protocol::{
    Downlink, InboundFrame, Pcm16Decoder, ProtocolConfig, ProtocolError, RetryPolicy,
    SessionReport, StreamingProtocolClient, Transport, Uplink,
};
use beacon_endpoint::voice::{
    CaptureConfig, CaptureSession, CleaningStrategy, Microphone, PlaybackConfig, PlaybackEvent,
    PlaybackSession, Speaker,
};
use beacon_endpoint::{Error, Result};

/// Microphone producing a constant sample value at a steady pace
pub struct FakeMicrophone {
    value: i16,
    pace: Duration,
    reads: AtomicUsize,
}

impl FakeMicrophone {
    #[must_use]
    pub fn new(value: i16) -> Self {
        Self {
            value,
            pace: Duration::from_millis(2),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn read(&self, frame: &mut [i16]) -> Result<usize> {
        tokio::time::sleep(self.pace).await;
        frame.fill(self.value);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(frame.len())
    }
}

/// Speaker that records everything written to it
#[derive(Default)]
pub struct RecordingSpeaker {
    written: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    fail: AtomicBool,
    pace_ms: AtomicU64,
}

impl RecordingSpeaker {
    pub fn bytes(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Sleep this long on every write, like a device in real time
    pub fn set_pace(&self, pace: Duration) {
        self.pace_ms
            .store(u64::try_from(pace.as_millis()).unwrap(), Ordering::Relaxed);
    }
}

#[async_trait]
impl Speaker for RecordingSpeaker {
    async fn write(&self, pcm: &[u8]) -> Result<()> {
        let pace = self.pace_ms.load(Ordering::Relaxed);
        if pace > 0 {
            tokio::time::sleep(Duration::from_millis(pace)).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::Audio("speaker unplugged".to_string()));
        }
        self.written.lock().unwrap().extend_from_slice(pcm);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// How the fake backend answers one session
pub enum Reply {
    /// Frames delivered once the final chunk is uploaded
    Frames(Vec<InboundFrame>),
    /// The final chunk upload fails
    UploadError(ProtocolError),
    /// The session cannot be opened
    OpenError(ProtocolError),
    /// Nothing ever comes back
    Nothing,
}

/// One uploaded chunk as seen by the backend
#[derive(Debug, Clone)]
pub struct Upload {
    pub session_id: String,
    pub chunk: AudioChunk,
}

/// Backend fake answering each opened session from a script
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    uploads: Arc<Mutex<Vec<Upload>>>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    /// Uploads of the `n`-th session attempt (zero-based)
    ///
    /// Every attempt starts again at index zero, retries included.
    pub fn session_uploads(&self, n: usize) -> Vec<Upload> {
        let mut sessions: Vec<Vec<Upload>> = Vec::new();
        for upload in self.uploads() {
            match sessions.last_mut() {
                Some(current) if upload.chunk.index != 0 => current.push(upload),
                _ => sessions.push(vec![upload]),
            }
        }
        sessions.into_iter().nth(n).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        session_id: &str,
    ) -> std::result::Result<(Box<dyn Uplink>, Box<dyn Downlink>), ProtocolError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Nothing);
        if let Reply::OpenError(e) = reply {
            return Err(e);
        }

        let (frames, rx) = mpsc::channel(64);
        let uplink = ScriptedUplink {
            session_id: session_id.to_string(),
            uploads: Arc::clone(&self.uploads),
            reply: Some(reply),
            frames,
        };
        Ok((Box::new(uplink), Box::new(ScriptedDownlink { rx })))
    }
}

struct ScriptedUplink {
    session_id: String,
    uploads: Arc<Mutex<Vec<Upload>>>,
    reply: Option<Reply>,
    frames: mpsc::Sender<InboundFrame>,
}

#[async_trait]
impl Uplink for ScriptedUplink {
    async fn send(&mut self, chunk: &AudioChunk) -> std::result::Result<(), ProtocolError> {
        self.uploads.lock().unwrap().push(Upload {
            session_id: self.session_id.clone(),
            chunk: chunk.clone(),
        });
        if !chunk.is_final {
            return Ok(());
        }

        match self.reply.take() {
            Some(Reply::Frames(frames)) => {
                for frame in frames {
                    self.frames
                        .send(frame)
                        .await
                        .map_err(|_| ProtocolError::ConnectionUnavailable)?;
                }
                Ok(())
            }
            Some(Reply::UploadError(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

struct ScriptedDownlink {
    rx: mpsc::Receiver<InboundFrame>,
}

#[async_trait]
impl Downlink for ScriptedDownlink {
    async fn next_frame(
        &mut self,
        wait: Duration,
    ) -> std::result::Result<Option<InboundFrame>, ProtocolError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}

/// PCM16 bytes of `samples` copies of `value`
pub fn pcm(samples: usize, value: i16) -> Vec<u8> {
    std::iter::repeat_n(value.to_le_bytes(), samples)
        .flatten()
        .collect()
}

/// Small real-time settings so tests finish quickly
pub fn fast_capture_config() -> CaptureConfig {
    CaptureConfig {
        frame_samples: 160,
        chunk_samples: 320,
        max_duration: Duration::from_secs(5),
        read_retry_delay: Duration::from_millis(5),
    }
}

pub fn fast_playback_config() -> PlaybackConfig {
    PlaybackConfig {
        channel_capacity: 9_600,
        prebuffer_bytes: 2_400,
        read_size: 960,
        write_timeout: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(5),
        ..PlaybackConfig::default()
    }
}

pub fn fast_protocol_config() -> ProtocolConfig {
    ProtocolConfig {
        chunk_timeout: Duration::from_secs(1),
        response_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(1),
        idle_check_interval: Duration::from_millis(10),
        idle_checks: 5,
        ..ProtocolConfig::default()
    }
}

pub fn fast_retry_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

/// A protocol client wired to fakes
pub struct ClientHarness {
    pub client: StreamingProtocolClient,
    pub reports: mpsc::Receiver<SessionReport>,
    pub playback: PlaybackSession,
    pub playback_events: mpsc::Receiver<PlaybackEvent>,
    pub speaker: Arc<RecordingSpeaker>,
    pub transport: Arc<ScriptedTransport>,
    pub link: watch::Sender<bool>,
}

pub fn client_harness(replies: Vec<Reply>, playback: PlaybackConfig) -> ClientHarness {
    let speaker = Arc::new(RecordingSpeaker::default());
    let transport = Arc::new(ScriptedTransport::new(replies));
    let (playback, playback_events) =
        PlaybackSession::new(speaker.clone(), None, playback).unwrap();
    let (link, connectivity) = watch::channel(true);
    let (client, reports) = StreamingProtocolClient::new(
        transport.clone(),
        Arc::new(Pcm16Decoder),
        playback.clone(),
        connectivity,
        fast_protocol_config(),
    );

    ClientHarness {
        client,
        reports,
        playback,
        playback_events,
        speaker,
        transport,
        link,
    }
}

/// A running assistant wired to fakes
pub struct AssistantHarness {
    pub assistant: Assistant,
    pub status: watch::Receiver<AssistantStatus>,
    pub speaker: Arc<RecordingSpeaker>,
    pub transport: Arc<ScriptedTransport>,
    pub link: watch::Sender<bool>,
}

pub fn spawn_assistant(replies: Vec<Reply>, config: AssistantConfig) -> AssistantHarness {
    spawn_assistant_with(replies, config, fast_capture_config())
}

pub fn spawn_assistant_with(
    replies: Vec<Reply>,
    config: AssistantConfig,
    capture: CaptureConfig,
) -> AssistantHarness {
    let speaker = Arc::new(RecordingSpeaker::default());
    let transport = Arc::new(ScriptedTransport::new(replies));
    let (playback, playback_events) =
        PlaybackSession::new(speaker.clone(), None, fast_playback_config()).unwrap();
    let (link, connectivity) = watch::channel(true);
    let (client, session_reports) = StreamingProtocolClient::new(
        transport.clone(),
        Arc::new(Pcm16Decoder),
        playback.clone(),
        connectivity.clone(),
        fast_protocol_config(),
    );

    let assistant = Assistant::spawn(
        Components {
            capture: CaptureSession::new(Arc::new(FakeMicrophone::new(100)), capture),
            playback,
            playback_events,
            client,
            session_reports,
            connectivity,
            identity: Arc::new(StaticIdentity("test-device".to_string())),
            cleaning: Box::new(|| CleaningStrategy::Passthrough),
        },
        config,
    );
    let status = assistant.subscribe();

    AssistantHarness {
        assistant,
        status,
        speaker,
        transport,
        link,
    }
}

/// Wait until the published state equals `state`
pub async fn wait_for_state(
    status: &mut watch::Receiver<AssistantStatus>,
    state: AssistantState,
) -> AssistantStatus {
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
    .expect("assistant stopped");
    *snapshot
}

/// Wait for the next session report
pub async fn next_report(reports: &mut mpsc::Receiver<SessionReport>) -> SessionReport {
    tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("timed out waiting for a session report")
        .expect("report channel closed")
}
