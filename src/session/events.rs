//! Session-level events surfaced to the recognizer.

/// Events emitted on the session event stream. Offsets are in 100-ns ticks,
/// relative to the start of the session (not the current turn).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
    },
    SessionStopped {
        session_id: String,
    },
    SpeechStartDetected {
        session_id: String,
        offset: u64,
    },
    SpeechEndDetected {
        session_id: String,
        offset: u64,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id }
            | Self::SessionStopped { session_id }
            | Self::SpeechStartDetected { session_id, .. }
            | Self::SpeechEndDetected { session_id, .. } => session_id,
        }
    }
}
