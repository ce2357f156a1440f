//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/endpoint.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct EndpointConfigFile {
    /// Backend connection
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// Exchange behaviour
    #[serde(default)]
    pub assistant: AssistantFileConfig,

    /// Microphone capture
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Speaker playback
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Protocol timing
    #[serde(default)]
    pub protocol: ProtocolFileConfig,
}

/// Backend connection settings
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    /// Upload URL (`http(s)://`) or socket URL (`ws(s)://`)
    pub url: Option<String>,

    /// Shared assistant token
    pub token: Option<String>,

    /// "http" or "websocket"
    pub transport: Option<String>,

    /// Reply encoding: "pcm16" or "mp3"
    pub audio_format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantFileConfig {
    /// "discrete" or "continuous"
    pub variant: Option<String>,

    /// Re-attempts after a retryable failure
    pub max_retries: Option<u32>,

    /// Base back-off between re-attempts
    pub retry_base_ms: Option<u64>,

    /// Initial playback volume (0-100)
    pub volume: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Samples per chunk at 16 kHz
    pub chunk_samples: Option<usize>,

    /// Capture stops on its own after this long
    pub max_duration_secs: Option<u64>,

    /// Echo reference window
    pub reference_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Streaming channel capacity in bytes
    pub buffer_bytes: Option<usize>,

    /// Bytes buffered before streaming output begins
    pub prebuffer_bytes: Option<usize>,

    /// Longest wait for a stream to drain
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProtocolFileConfig {
    pub chunk_timeout_secs: Option<u64>,
    pub response_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,

    /// Empty checks after which a streamed reply is considered complete
    pub idle_checks: Option<u32>,

    pub max_response_bytes: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `EndpointConfigFile::default()` if the file doesn't exist or can't
/// be parsed.
pub fn load_config_file() -> EndpointConfigFile {
    let Some(path) = config_file_path() else {
        return EndpointConfigFile::default();
    };

    if !path.exists() {
        return EndpointConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            EndpointConfigFile::default()
        }
    }
}

/// Parse one config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<EndpointConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/omni/beacon/endpoint.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("endpoint.toml")
    })
}
