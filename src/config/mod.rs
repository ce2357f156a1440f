//! Configuration management for the Beacon endpoint
//!
//! Values resolve as environment > TOML file > default and are validated
//! once at load time.

pub mod file;

use std::time::Duration;

use crate::assistant::{AssistantConfig, AssistantVariant};
use crate::audio::reference::DEFAULT_REFERENCE_MS;
use crate::protocol::{ProtocolConfig, RetryPolicy};
use crate::voice::{CaptureConfig, PlaybackConfig};
use crate::{Error, Result};

use self::file::EndpointConfigFile;

/// Backend URL used when nothing is configured
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000/v1/audio";

/// How chunks reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// One JSON POST per chunk
    #[default]
    Http,
    /// Persistent socket with binary audio frames
    WebSocket,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "websocket" | "ws" => Ok(Self::WebSocket),
            other => Err(Error::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Encoding of reply audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    /// 24 kHz mono PCM16LE
    #[default]
    Pcm16,
    Mp3,
}

impl std::str::FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm16" | "pcm" => Ok(Self::Pcm16),
            "mp3" => Ok(Self::Mp3),
            other => Err(Error::Config(format!("unknown audio format: {other}"))),
        }
    }
}

/// Backend connection configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    /// Sent as `X-Assistant-Token`
    pub token: Option<String>,
    pub transport: TransportKind,
    pub audio_format: AudioFormat,
}

/// Beacon endpoint configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub assistant: AssistantConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub protocol: ProtocolConfig,
    /// Echo reference window in milliseconds
    pub reference_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                url: DEFAULT_BACKEND_URL.to_string(),
                token: None,
                transport: TransportKind::default(),
                audio_format: AudioFormat::default(),
            },
            assistant: AssistantConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            protocol: ProtocolConfig::default(),
            reference_ms: DEFAULT_REFERENCE_MS,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the optional config file
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or the result is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge `fc` and the variables visible through `env` over the defaults
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or the result is invalid
    pub fn resolve<F>(fc: EndpointConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Backend (env > toml > default)
        if let Some(url) = env("BEACON_BACKEND_URL").or(fc.backend.url) {
            config.backend.url = url;
        }
        config.backend.token = env("BEACON_BACKEND_TOKEN").or(fc.backend.token);
        if let Some(transport) = env("BEACON_TRANSPORT").or(fc.backend.transport) {
            config.backend.transport = transport.parse()?;
        }
        if let Some(format) = fc.backend.audio_format {
            config.backend.audio_format = format.parse()?;
        }

        // Assistant
        if let Some(variant) = env("BEACON_VARIANT").or(fc.assistant.variant) {
            config.assistant.variant = variant.parse()?;
        }
        config.assistant.retry = RetryPolicy {
            max_retries: fc
                .assistant
                .max_retries
                .unwrap_or(config.assistant.retry.max_retries),
            base_delay: fc
                .assistant
                .retry_base_ms
                .map_or(config.assistant.retry.base_delay, Duration::from_millis),
            ..config.assistant.retry
        };
        let volume = match env("BEACON_VOLUME") {
            Some(v) => Some(
                v.trim()
                    .parse::<u8>()
                    .map_err(|e| Error::Config(format!("invalid BEACON_VOLUME {v:?}: {e}")))?,
            ),
            None => fc.assistant.volume,
        };
        if let Some(volume) = volume {
            config.playback.volume = volume;
        }

        // Capture
        if let Some(samples) = fc.capture.chunk_samples {
            config.capture.chunk_samples = samples;
        }
        if let Some(secs) = fc.capture.max_duration_secs {
            config.capture.max_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = fc.capture.reference_ms {
            config.reference_ms = ms;
        }

        // Playback
        if let Some(bytes) = fc.playback.buffer_bytes {
            config.playback.channel_capacity = bytes;
        }
        if let Some(bytes) = fc.playback.prebuffer_bytes {
            config.playback.prebuffer_bytes = bytes;
        }
        if let Some(secs) = fc.playback.drain_timeout_secs {
            config.playback.drain_timeout = Duration::from_secs(secs);
        }

        // Protocol
        let p = &mut config.protocol;
        if let Some(secs) = fc.protocol.chunk_timeout_secs {
            p.chunk_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = fc.protocol.response_timeout_secs {
            p.response_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = fc.protocol.connect_timeout_secs {
            p.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(checks) = fc.protocol.idle_checks {
            p.idle_checks = checks;
        }
        if let Some(bytes) = fc.protocol.max_response_bytes {
            p.max_response_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.backend.url.trim().is_empty() {
            return Err(Error::Config("backend url is empty".to_string()));
        }
        let ws_url = self.backend.url.starts_with("ws://") || self.backend.url.starts_with("wss://");
        match self.backend.transport {
            TransportKind::WebSocket if !ws_url => {
                return Err(Error::Config(format!(
                    "websocket transport needs a ws:// or wss:// url, got {}",
                    self.backend.url
                )));
            }
            TransportKind::Http if ws_url => {
                return Err(Error::Config(format!(
                    "http transport cannot use {}",
                    self.backend.url
                )));
            }
            _ => {}
        }

        if self.capture.frame_samples == 0 || self.capture.chunk_samples == 0 {
            return Err(Error::Config(
                "capture frame and chunk sizes must be non-zero".to_string(),
            ));
        }
        if self.playback.channel_capacity == 0 || self.playback.read_size == 0 {
            return Err(Error::Config(
                "playback buffer and read size must be non-zero".to_string(),
            ));
        }
        if self.playback.prebuffer_bytes > self.playback.channel_capacity {
            return Err(Error::Config(format!(
                "pre-buffer {} exceeds playback buffer {}",
                self.playback.prebuffer_bytes, self.playback.channel_capacity
            )));
        }
        if self.playback.volume > 100 {
            return Err(Error::Config(format!(
                "volume {} is above 100",
                self.playback.volume
            )));
        }
        if self.reference_ms == 0 {
            return Err(Error::Config("reference window must be non-zero".to_string()));
        }
        if self.protocol.max_response_bytes == 0 || self.protocol.upload_queue == 0 {
            return Err(Error::Config(
                "protocol buffers must be non-zero".to_string(),
            ));
        }
        if self.protocol.idle_checks == 0 {
            return Err(Error::Config(
                "idle checks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::resolve(EndpointConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.backend.url, DEFAULT_BACKEND_URL);
        assert_eq!(config.backend.transport, TransportKind::Http);
        assert_eq!(config.playback.channel_capacity, 96_000);
        assert_eq!(config.playback.prebuffer_bytes, 24_000);
        assert_eq!(config.capture.chunk_samples, 1600);
        assert_eq!(config.reference_ms, 500);
    }

    #[test]
    fn env_overrides_file() {
        let fc: EndpointConfigFile = toml::from_str(
            r#"
            [backend]
            url = "http://file.local/v1/audio"
            token = "file-token"

            [assistant]
            volume = 40
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            env_of(&[
                ("BEACON_BACKEND_URL", "ws://env.local/v1/stream"),
                ("BEACON_TRANSPORT", "websocket"),
                ("BEACON_VARIANT", "continuous"),
                ("BEACON_VOLUME", "70"),
            ]),
        )
        .unwrap();

        assert_eq!(config.backend.url, "ws://env.local/v1/stream");
        assert_eq!(config.backend.token.as_deref(), Some("file-token"));
        assert_eq!(config.backend.transport, TransportKind::WebSocket);
        assert_eq!(config.assistant.variant, AssistantVariant::Continuous);
        assert_eq!(config.playback.volume, 70);
    }

    #[test]
    fn oversized_prebuffer_is_rejected() {
        let fc: EndpointConfigFile = toml::from_str(
            r"
            [playback]
            buffer_bytes = 1000
            prebuffer_bytes = 2000
            ",
        )
        .unwrap();
        assert!(matches!(
            Config::resolve(fc, env_of(&[])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let fc: EndpointConfigFile = toml::from_str("[playback]\nbuffer_bytes = 0\nprebuffer_bytes = 0").unwrap();
        assert!(Config::resolve(fc, env_of(&[])).is_err());
    }

    #[test]
    fn volume_above_range_is_rejected() {
        assert!(Config::resolve(EndpointConfigFile::default(), env_of(&[("BEACON_VOLUME", "150")])).is_err());
        assert!(Config::resolve(EndpointConfigFile::default(), env_of(&[("BEACON_VOLUME", "loud")])).is_err());
    }

    #[test]
    fn transport_must_match_url_scheme() {
        assert!(Config::resolve(
            EndpointConfigFile::default(),
            env_of(&[("BEACON_TRANSPORT", "websocket")])
        )
        .is_err());
        assert!(Config::resolve(
            EndpointConfigFile::default(),
            env_of(&[("BEACON_BACKEND_URL", "wss://speech.example/v1")])
        )
        .is_err());
    }

    #[test]
    fn zero_idle_checks_is_rejected() {
        let fc: EndpointConfigFile = toml::from_str("[protocol]\nidle_checks = 0").unwrap();
        assert!(matches!(
            Config::resolve(fc, env_of(&[])),
            Err(Error::Config(_))
        ));
    }
}
