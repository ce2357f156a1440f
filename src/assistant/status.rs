//! Observable assistant state

use tokio::sync::watch;

/// Top-level state of the voice exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssistantState {
    #[default]
    Idle,
    /// Capturing a discrete utterance
    Recording,
    /// Capturing on a persistent session while replies may play
    Streaming,
    /// Capture finished, waiting for the reply
    Sending,
    /// Reply audio is playing
    Playing,
    /// Last exchange failed; a new start clears it
    Error,
}

impl AssistantState {
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether a start intent is accepted in this state
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl std::fmt::Display for AssistantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Recording => write!(f, "recording"),
            Self::Streaming => write!(f, "streaming"),
            Self::Sending => write!(f, "sending"),
            Self::Playing => write!(f, "playing"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Full snapshot published on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssistantStatus {
    pub state: AssistantState,
    pub connected: bool,
    pub session_active: bool,
}

impl std::fmt::Display for AssistantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.state,
            if self.connected { "online" } else { "offline" },
            if self.session_active {
                "session open"
            } else {
                "no session"
            }
        )
    }
}

/// Publish `status` only if it differs from the current snapshot
pub fn publish(sender: &watch::Sender<AssistantStatus>, status: AssistantStatus) -> bool {
    sender.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    })
}
