//! Client-side session core for real-time streaming speech recognition.
//!
//! The crate drives a bidirectional, long-lived connection to a cloud
//! speech-recognition service: it establishes and maintains an authenticated
//! transport, negotiates each session with `speech.config` and
//! `speech.context` handshake messages, streams captured audio upstream with
//! real-time pacing, consumes service events and phrase results on the
//! downstream, and coordinates the recognition lifecycle across credential
//! expiry, mid-stream disconnects, continuous and single-shot modes, and
//! cancellation.
//!
//! Audio capture, credential acquisition, and result parsing stay behind the
//! [`audio::AudioSource`], [`auth::AuthProvider`], and
//! [`session::RecognitionHandler`] traits; the [`transport`] module ships a
//! default WebSocket implementation of the connection contract.

pub mod audio;
pub mod auth;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

// Re-export commonly used items for convenience
pub use audio::{
    AudioChunk, AudioDeviceInfo, AudioSource, AudioSourceEvent, AudioStreamFormat,
    AudioStreamNode, PushAudioSource, ReplayableAudioStream,
};
pub use auth::{AuthInfo, AuthProvider, SubscriptionKeyAuth};
pub use config::{
    OutputFormat, ProfanityOption, PropertyCollection, RecognitionMode, RecognitionSettings,
    RecognizerConfig,
};
pub use error::SessionError;
pub use session::{
    CancellationDetails, CancellationErrorCode, CancellationReason, DynamicGrammarBuilder,
    MessageContext, RecognitionHandler, RequestSession, SessionCore, SessionEvent, SpeechContext,
};
pub use transport::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionState, MessagePayload, OpenResponse,
    RawMessage,
};
