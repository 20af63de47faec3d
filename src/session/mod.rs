//! The recognition session core: per-request state, the configuration
//! handshake, the upstream audio pump, the downstream dispatcher, and the
//! controller that sequences them.

pub mod context;
pub mod core;
pub mod events;
pub mod handler;
pub mod request_session;
pub mod service_config;
pub mod telemetry;

pub(crate) mod connection_manager;

#[cfg(test)]
mod tests;

pub use self::context::{DynamicGrammarBuilder, SpeechContext};
pub use self::core::SessionCore;
pub use self::events::SessionEvent;
pub use self::handler::{
    CancellationDetails, CancellationErrorCode, CancellationReason, MessageContext,
    RecognitionHandler,
};
pub use self::request_session::RequestSession;
pub use self::service_config::SpeechServiceConfig;
pub use self::telemetry::TelemetryPayload;

/// Mint an opaque identifier: 32 lowercase hex characters, no dashes. Used
/// for session, request, connection, and auth-fetch ids alike.
pub fn mint_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
