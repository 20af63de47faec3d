//! Connection establishment and the configuration handshake.
//!
//! [`ConnectionManager`] owns the single stored connection: repeated
//! `connect` calls share it until it fails or is observed `Disconnected`, in
//! which case the next call dials afresh. A 403 from the open handshake is
//! answered exactly once with the auth provider's expiry path and a redial
//! under a new connection id.
//!
//! [`Configurator`] layers the `speech.config` / `speech.context` ordering
//! on top: config at most once per connection per recognition, context once
//! per turn, audio only ever after a resolved context send.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::config::RecognizerConfig;
use crate::error::SessionError;
use crate::transport::message::{PATH_SPEECH_CONFIG, PATH_SPEECH_CONTEXT};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionState, RawMessage,
};

use super::mint_id;
use super::request_session::RequestSession;

// =============================================================================
// Connection manager
// =============================================================================

pub(crate) struct ConnectionManager {
    auth: Arc<dyn AuthProvider>,
    factory: Arc<dyn ConnectionFactory>,
    /// Forwarding target for every created connection's event stream.
    connection_events: broadcast::Sender<ConnectionEvent>,
    /// The single stored connection. The lock is held across the dial so
    /// concurrent callers observe one attempt.
    slot: tokio::sync::Mutex<Option<Arc<dyn Connection>>>,
}

impl ConnectionManager {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        factory: Arc<dyn ConnectionFactory>,
        connection_events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            auth,
            factory,
            connection_events,
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the stored open connection, dialing a new one when none is
    /// stored or the stored one has disconnected.
    pub async fn connect(
        &self,
        config: &RecognizerConfig,
        session: &Arc<RequestSession>,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.state() != ConnectionState::Disconnected {
                return Ok(connection.clone());
            }
            debug!(connection_id = %connection.id(), "stored connection is gone; redialing");
            connection.dispose().await;
            *slot = None;
        }

        let connection = self.dial(config, session).await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// One dial attempt, with a single internal retry through the auth
    /// expiry path when the service answers 403.
    async fn dial(
        &self,
        config: &RecognizerConfig,
        session: &Arc<RequestSession>,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        let mut retry_on_expiry = false;
        loop {
            let auth_fetch_event_id = mint_id();
            let connection_id = mint_id();
            session.on_pre_connection_start(&auth_fetch_event_id, &connection_id);

            let auth_result = if retry_on_expiry {
                self.auth.fetch_on_expiry(&auth_fetch_event_id).await
            } else {
                self.auth.fetch(&auth_fetch_event_id).await
            };
            let auth = match auth_result {
                Ok(auth) => {
                    session.on_auth_completed(false, None);
                    auth
                }
                Err(e) => {
                    session.on_auth_completed(true, Some(&e.to_string()));
                    return Err(e);
                }
            };

            let connection = self.factory.create(config, &auth, &connection_id)?;
            session.listen_for_service_telemetry(connection.events());
            self.forward_events(connection.events());

            let response = connection.open().await?;
            match response.status {
                200 => {
                    session.on_connection_establish_completed(200, None);
                    info!(connection_id = %connection_id, "connection established");
                    return Ok(connection);
                }
                403 if !retry_on_expiry => {
                    session.on_connection_establish_completed(403, Some(&response.reason));
                    warn!(connection_id = %connection_id, "credential rejected; refetching and redialing");
                    connection.dispose().await;
                    retry_on_expiry = true;
                }
                status => {
                    session.on_connection_establish_completed(status, Some(&response.reason));
                    connection.dispose().await;
                    return Err(SessionError::ConnectionFailure {
                        status,
                        endpoint: config.endpoint(),
                        reason: response.reason,
                    });
                }
            }
        }
    }

    /// Forward one connection's events onto the core's stream until the
    /// connection's sender drops.
    fn forward_events(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        let sink = self.connection_events.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = sink.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Drop and dispose the stored connection.
    pub async fn dispose_current(&self) {
        if let Some(connection) = self.slot.lock().await.take() {
            connection.dispose().await;
        }
    }
}

// =============================================================================
// Configurator
// =============================================================================

/// Payloads for one configuration pass, built lazily by the caller so a
/// cache hit serializes nothing.
pub(crate) struct ConfigurePayloads {
    pub request_id: String,
    pub config_json: String,
    pub context_json: String,
}

#[derive(Default)]
struct ConfiguredSlot {
    /// Connection with config + context sent for the current turn.
    ready: Option<Arc<dyn Connection>>,
    /// Connection id `speech.config` was last sent on. Survives `begin_turn`
    /// so continuous turns on one connection send config exactly once.
    config_sent_on: Option<String>,
}

pub(crate) struct Configurator {
    manager: ConnectionManager,
    slot: tokio::sync::Mutex<ConfiguredSlot>,
}

impl Configurator {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            slot: tokio::sync::Mutex::new(ConfiguredSlot::default()),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Return a connection on which `speech.config` and `speech.context`
    /// have both been sent. Config is skipped when this connection already
    /// received it during this recognition; context is sent whenever the
    /// ready slot was cleared (new turn, reconnect, new recognition).
    pub async fn configure(
        &self,
        config: &RecognizerConfig,
        session: &Arc<RequestSession>,
        build_payloads: impl FnOnce() -> Result<ConfigurePayloads, SessionError>,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = slot.ready.as_ref() {
            if connection.state() != ConnectionState::Disconnected {
                return Ok(connection.clone());
            }
            slot.ready = None;
        }

        let connection = self.manager.connect(config, session).await?;
        let payloads = build_payloads()?;

        if slot.config_sent_on.as_deref() != Some(connection.id()) {
            connection
                .send(RawMessage::text(
                    PATH_SPEECH_CONFIG,
                    &payloads.request_id,
                    payloads.config_json,
                ))
                .await?;
            slot.config_sent_on = Some(connection.id().to_string());
        }

        connection
            .send(RawMessage::text(
                PATH_SPEECH_CONTEXT,
                &payloads.request_id,
                payloads.context_json,
            ))
            .await?;

        slot.ready = Some(connection.clone());
        Ok(connection)
    }

    /// Clear the ready slot so the next `configure` re-sends `speech.context`
    /// for the new turn (config stays sent on an unchanged connection).
    pub async fn begin_turn(&self) {
        self.slot.lock().await.ready = None;
    }

    /// Forget everything; the next `configure` re-sends config and context.
    /// Called when a new recognition starts.
    pub async fn reset(&self) {
        *self.slot.lock().await = ConfiguredSlot::default();
    }

    /// The currently configured connection, if any, without dialing.
    pub async fn current(&self) -> Option<Arc<dyn Connection>> {
        self.slot.lock().await.ready.clone()
    }
}
