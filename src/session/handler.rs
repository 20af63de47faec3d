//! Extension point for recognizer subtypes.
//!
//! The core handles the protocol control paths (`turn.start`, `turn.end`,
//! `speech.startdetected`, `speech.enddetected`); everything else (phrase
//! and hypothesis results, translation payloads, intent payloads) is handed
//! to the injected [`RecognitionHandler`]. Handlers must not assume any
//! ordering beyond what the protocol provides and have no access to
//! connection or pump state.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::transport::RawMessage;

/// Why a recognition was cancelled locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// A failure ended the recognition.
    Error,
    /// The audio stream ended and the service confirmed the final turn.
    EndOfStream,
}

/// Structured code accompanying a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationErrorCode {
    NoError,
    AuthenticationFailure,
    ConnectionFailure,
    RuntimeError,
}

/// Details delivered to the handler when a recognition is cancelled locally.
#[derive(Debug, Clone)]
pub struct CancellationDetails {
    pub session_id: String,
    pub request_id: String,
    pub reason: CancellationReason,
    pub code: CancellationErrorCode,
    pub message: String,
}

/// Read-only session facts accompanying each delegated message.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub session_id: String,
    pub request_id: String,
    /// Cumulative audio offset (ticks) of concluded turns; lets handlers
    /// report session-relative phrase offsets in continuous mode.
    pub turn_audio_offset: u64,
}

/// Capability interface for recognizer-subtype message processing.
#[async_trait]
pub trait RecognitionHandler: Send + Sync {
    /// Process a service message the core does not handle itself.
    async fn process_message(
        &self,
        message: RawMessage,
        context: &MessageContext,
    ) -> Result<(), SessionError>;

    /// Map a local cancellation to user-facing results and events.
    async fn cancel_recognition(&self, details: CancellationDetails);
}
