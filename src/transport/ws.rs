//! WebSocket transport implementation.
//!
//! Dials the service endpoint with the recognizer's query parameters, sets
//! the credential and `X-ConnectionId` headers on the upgrade request, and
//! bridges the socket to the [`Connection`] contract through a pair of
//! bounded queues owned by a background socket task.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthInfo;
use crate::config::{RecognizerConfig, property_id};
use crate::error::SessionError;

use super::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionState, OpenResponse, RawMessage,
};

/// Default host pattern used when only a region is configured.
const DEFAULT_HOST_SUFFIX: &str = "stt.speech.microsoft.com";

const CONNECTION_ID_HEADER: &str = "X-ConnectionId";

/// Upper bound on the upgrade handshake; a hung dial would otherwise pin
/// the connection manager's single-flight slot.
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the service URL: the explicit endpoint property when present,
/// otherwise the regional default with the mode path segment. The
/// recognizer's settings are appended as query parameters either way.
pub fn build_endpoint_url(config: &RecognizerConfig) -> Result<Url, SessionError> {
    let endpoint = config.endpoint();
    let base = if endpoint.is_empty() {
        let region = config
            .properties
            .get(property_id::REGION)
            .filter(|r| !r.is_empty())
            .ok_or(SessionError::ArgumentNull("endpoint or region"))?;
        format!(
            "wss://{region}.{DEFAULT_HOST_SUFFIX}/speech/recognition/{}/cognitiveservices/v1",
            config.mode.endpoint_path()
        )
    } else {
        endpoint
    };

    let mut url = Url::parse(&base)
        .map_err(|e| SessionError::Transport(format!("invalid endpoint url {base:?}: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in config.settings.query_params() {
            pairs.append_pair(name, &value);
        }
    }
    Ok(url)
}

/// Live socket handles, present once `open` succeeds.
struct SocketHandles {
    outbound: mpsc::Sender<RawMessage>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// WebSocket-backed [`Connection`].
pub struct WsConnection {
    id: String,
    url: Url,
    auth: AuthInfo,
    /// Shared with the socket task, which flips it to `Disconnected`.
    state: Arc<Mutex<ConnectionState>>,
    handles: Mutex<Option<SocketHandles>>,
    inbound: tokio::sync::Mutex<Option<mpsc::Receiver<RawMessage>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl WsConnection {
    fn new(url: Url, auth: AuthInfo, connection_id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: connection_id.to_string(),
            url,
            auth,
            state: Arc::new(Mutex::new(ConnectionState::None)),
            handles: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
            events,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

#[async_trait::async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn open(&self) -> Result<OpenResponse, SessionError> {
        self.set_state(ConnectionState::Connecting);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Transport(format!("invalid upgrade request: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            http::header::HeaderName::from_bytes(self.auth.header_name.as_bytes())
                .map_err(|e| SessionError::Transport(format!("invalid auth header name: {e}")))?,
            http::header::HeaderValue::from_str(&self.auth.token)
                .map_err(|e| SessionError::Transport(format!("invalid auth header value: {e}")))?,
        );
        headers.insert(
            CONNECTION_ID_HEADER,
            http::header::HeaderValue::from_str(&self.id)
                .map_err(|e| SessionError::Transport(format!("invalid connection id: {e}")))?,
        );

        let stream = match timeout(OPEN_TIMEOUT, connect_async(request)).await {
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(SessionError::Transport(format!(
                    "websocket open timed out after {}s",
                    OPEN_TIMEOUT.as_secs()
                )));
            }
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(tungstenite::Error::Http(response))) => {
                // The service rejected the upgrade; surface the status so the
                // manager can run the 403 re-auth path.
                let status = response.status();
                self.set_state(ConnectionState::Disconnected);
                warn!(connection_id = %self.id, %status, "websocket upgrade rejected");
                return Ok(OpenResponse {
                    status: status.as_u16(),
                    reason: status
                        .canonical_reason()
                        .unwrap_or("upgrade rejected")
                        .to_string(),
                });
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(SessionError::Transport(format!(
                    "websocket open failed: {e}"
                )));
            }
        };

        info!(connection_id = %self.id, "websocket connection established");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<RawMessage>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<RawMessage>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        *self.inbound.lock().await = Some(inbound_rx);
        *self.handles.lock() = Some(SocketHandles {
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
        });
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(ConnectionEvent::Established {
            connection_id: self.id.clone(),
        });

        let (mut ws_sink, mut ws_stream) = stream.split();
        let connection_id = self.id.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut close_status: u16 = 1000;
            let mut close_reason = String::new();
            loop {
                tokio::select! {
                    // Prioritize outbound audio for lowest latency.
                    biased;

                    outbound = outbound_rx.recv() => {
                        let Some(frame) = outbound else { break };
                        let path = frame.path.clone();
                        let ws_message = if frame.is_binary() {
                            frame.encode_binary().map(Message::Binary)
                        } else {
                            frame.encode_text().map(|t| Message::Text(t.into()))
                        };
                        let ws_message = match ws_message {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(connection_id = %connection_id, "dropping unencodable frame: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(ws_message).await {
                            close_status = 1006;
                            close_reason = e.to_string();
                            break;
                        }
                        let _ = events.send(ConnectionEvent::MessageSent {
                            connection_id: connection_id.clone(),
                            path,
                        });
                    }

                    inbound = ws_stream.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match RawMessage::decode_text(&text) {
                                    Ok(frame) => {
                                        let _ = events.send(ConnectionEvent::MessageReceived {
                                            connection_id: connection_id.clone(),
                                            path: frame.path.clone(),
                                        });
                                        if inbound_tx.send(frame).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!(connection_id = %connection_id, "bad text frame: {e}"),
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                match RawMessage::decode_binary(&data) {
                                    Ok(frame) => {
                                        let _ = events.send(ConnectionEvent::MessageReceived {
                                            connection_id: connection_id.clone(),
                                            path: frame.path.clone(),
                                        });
                                        if inbound_tx.send(frame).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!(connection_id = %connection_id, "bad binary frame: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(close))) => {
                                if let Some(close) = close {
                                    close_status = close.code.into();
                                    close_reason = close.reason.to_string();
                                }
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ping/pong handled by tungstenite.
                            }
                            Some(Err(e)) => {
                                close_status = 1006;
                                close_reason = e.to_string();
                                break;
                            }
                            None => break,
                        }
                    }

                    _ = &mut shutdown_rx => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            *state.lock() = ConnectionState::Disconnected;
            debug!(connection_id = %connection_id, close_status, "websocket connection closed");
            let _ = events.send(ConnectionEvent::Closed {
                connection_id: connection_id.clone(),
                status: close_status,
                reason: close_reason,
            });
            // Dropping inbound_tx lets pending reads drain to `None`.
        });

        Ok(OpenResponse {
            status: 200,
            reason: String::new(),
        })
    }

    async fn send(&self, message: RawMessage) -> Result<(), SessionError> {
        let sender = {
            let handles = self.handles.lock();
            handles
                .as_ref()
                .map(|h| h.outbound.clone())
                .ok_or_else(|| SessionError::Transport("connection is not open".to_string()))?
        };
        sender
            .send(message)
            .await
            .map_err(|_| SessionError::Transport("connection closed while sending".to_string()))
    }

    async fn read(&self) -> Result<Option<RawMessage>, SessionError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Ok(None),
        }
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) {
        let shutdown = {
            let mut handles = self.handles.lock();
            handles.as_mut().and_then(|h| h.shutdown.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Factory producing [`WsConnection`]s.
#[derive(Default)]
pub struct WsConnectionFactory;

impl WsConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ConnectionFactory for WsConnectionFactory {
    fn create(
        &self,
        config: &RecognizerConfig,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        let url = build_endpoint_url(config)?;
        Ok(Arc::new(WsConnection::new(url, auth.clone(), connection_id)))
    }
}
