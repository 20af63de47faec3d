//! Error types for the speech session core.

use thiserror::Error;

/// Errors surfaced by the session core.
///
/// Recoverable conditions (an expired credential answered with HTTP 403, a
/// connection observed in the `Disconnected` state) are handled internally
/// and never reach the caller; everything here is terminal for the current
/// recognition.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Credential fetch failed. Fatal to the recognition.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The transport open handshake failed or returned a non-recoverable
    /// status.
    #[error("unable to contact server. status: {status}, endpoint: {endpoint}, reason: {reason}")]
    ConnectionFailure {
        status: u16,
        endpoint: String,
        reason: String,
    },

    /// A transport-level send or read failed mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The audio source or stream node failed.
    #[error("audio source error: {0}")]
    AudioSource(String),

    /// An unexpected failure inside the pump or dispatch loops.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Construction-time validation failure.
    #[error("required argument was empty: {0}")]
    ArgumentNull(&'static str),

    /// The session core has been disposed.
    #[error("the session core has been disposed")]
    Disposed,

    /// A wire payload failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
