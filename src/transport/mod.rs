//! Transport abstraction: a framed duplex message channel to the service.
//!
//! The session core drives any [`Connection`] produced by a
//! [`ConnectionFactory`]; [`ws`] provides the default WebSocket-backed
//! implementation.

pub mod message;
pub mod ws;

pub use self::message::{MessagePayload, RawMessage};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::auth::AuthInfo;
use crate::config::RecognizerConfig;
use crate::error::SessionError;

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    None,
    Connecting,
    Connected,
    Disconnected,
}

/// Events published by a connection, observed by session telemetry and
/// forwarded to the core's connection event stream.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established {
        connection_id: String,
    },
    Closed {
        connection_id: String,
        status: u16,
        reason: String,
    },
    MessageReceived {
        connection_id: String,
        path: String,
    },
    MessageSent {
        connection_id: String,
        path: String,
    },
}

impl ConnectionEvent {
    /// Telemetry name for the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Established { .. } => "ConnectionEstablished",
            Self::Closed { .. } => "ConnectionClosed",
            Self::MessageReceived { .. } => "ConnectionMessageReceived",
            Self::MessageSent { .. } => "ConnectionMessageSent",
        }
    }
}

/// Result of the open handshake. Status follows HTTP semantics: 200 on
/// success, 403 for an expired credential (recovered by one re-auth), any
/// other value is fatal.
#[derive(Debug, Clone)]
pub struct OpenResponse {
    pub status: u16,
    pub reason: String,
}

/// A framed duplex message channel.
///
/// Sends are serialized in the order they are handed to the connection, so a
/// resolved send guarantees wire ordering relative to later sends.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Client-minted connection id, echoed by the service in
    /// `X-ConnectionId`.
    fn id(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Perform the open handshake.
    async fn open(&self) -> Result<OpenResponse, SessionError>;

    /// Queue one frame for transmission.
    async fn send(&self, message: RawMessage) -> Result<(), SessionError>;

    /// Read the next inbound frame. `Ok(None)` means the read queue is
    /// draining (the peer is gone and buffered frames are exhausted).
    async fn read(&self) -> Result<Option<RawMessage>, SessionError>;

    /// Subscribe to connection events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Tear the connection down. Idempotent.
    async fn dispose(&self);
}

/// Creates unopened connections for the manager to dial.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RecognizerConfig,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Connection>, SessionError>;
}
