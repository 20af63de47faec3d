//! Tests for connection establishment and the configuration handshake.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::auth::{AuthInfo, AuthProvider};
use crate::config::{RecognitionSettings, RecognizerConfig, property_id};
use crate::error::SessionError;
use crate::transport::message::{PATH_SPEECH_CONFIG, PATH_SPEECH_CONTEXT};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionState, OpenResponse, RawMessage,
};

use super::connection_manager::{ConfigurePayloads, ConnectionManager, Configurator};
use super::request_session::RequestSession;

// =============================================================================
// Stubs
// =============================================================================

type SentLog = Arc<Mutex<Vec<(String, RawMessage)>>>;

struct StubConnection {
    id: String,
    open_status: u16,
    open_delay: Duration,
    state: Mutex<ConnectionState>,
    sent: SentLog,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl Connection for StubConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn open(&self) -> Result<OpenResponse, SessionError> {
        tokio::time::sleep(self.open_delay).await;
        *self.state.lock() = if self.open_status == 200 {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        Ok(OpenResponse {
            status: self.open_status,
            reason: if self.open_status == 200 {
                String::new()
            } else {
                "rejected".to_string()
            },
        })
    }

    async fn send(&self, message: RawMessage) -> Result<(), SessionError> {
        self.sent.lock().push((self.id.clone(), message));
        Ok(())
    }

    async fn read(&self) -> Result<Option<RawMessage>, SessionError> {
        Ok(None)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
    }
}

struct StubFactory {
    open_statuses: Mutex<VecDeque<u16>>,
    open_delay: Duration,
    created: AtomicUsize,
    sent: SentLog,
}

impl StubFactory {
    fn new(open_statuses: &[u16]) -> Self {
        Self {
            open_statuses: Mutex::new(open_statuses.iter().copied().collect()),
            open_delay: Duration::ZERO,
            created: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// `(connection_id, path)` of everything sent, in order.
    fn sent_paths(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .iter()
            .map(|(id, m)| (id.clone(), m.path.clone()))
            .collect()
    }
}

impl ConnectionFactory for StubFactory {
    fn create(
        &self,
        _config: &RecognizerConfig,
        _auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        self.created.fetch_add(1, Ordering::AcqRel);
        let status = self.open_statuses.lock().pop_front().unwrap_or(200);
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(StubConnection {
            id: connection_id.to_string(),
            open_status: status,
            open_delay: self.open_delay,
            state: Mutex::new(ConnectionState::None),
            sent: self.sent.clone(),
            events,
        }))
    }
}

#[derive(Default)]
struct CountingAuth {
    fetches: AtomicUsize,
    expiry_fetches: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl AuthProvider for CountingAuth {
    async fn fetch(&self, _id: &str) -> Result<AuthInfo, SessionError> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        if self.fail {
            return Err(SessionError::AuthFailure("no credential".to_string()));
        }
        Ok(AuthInfo::new("Authorization", "Bearer token"))
    }

    async fn fetch_on_expiry(&self, _id: &str) -> Result<AuthInfo, SessionError> {
        self.expiry_fetches.fetch_add(1, Ordering::AcqRel);
        Ok(AuthInfo::new("Authorization", "Bearer fresh-token"))
    }
}

struct Harness {
    auth: Arc<CountingAuth>,
    factory: Arc<StubFactory>,
    manager: ConnectionManager,
    config: RecognizerConfig,
    session: Arc<RequestSession>,
}

fn harness(open_statuses: &[u16]) -> Harness {
    harness_with(StubFactory::new(open_statuses), CountingAuth::default())
}

fn harness_with(factory: StubFactory, auth: CountingAuth) -> Harness {
    let auth = Arc::new(auth);
    let factory = Arc::new(factory);
    let (events, _) = broadcast::channel(64);
    let manager = ConnectionManager::new(auth.clone(), factory.clone(), events);
    let session = Arc::new(RequestSession::new("stub-source".to_string()));
    session.start_new_recognition();
    Harness {
        auth,
        factory,
        manager,
        config: RecognizerConfig::new(RecognitionSettings::default()),
        session,
    }
}

fn payloads_for(session: &RequestSession) -> ConfigurePayloads {
    ConfigurePayloads {
        request_id: session.request_id(),
        config_json: "{\"context\":{}}".to_string(),
        context_json: "{}".to_string(),
    }
}

// =============================================================================
// Connection manager
// =============================================================================

mod manager_tests {
    use super::*;

    #[tokio::test]
    async fn connect_reuses_the_stored_connection() {
        let h = harness(&[]);
        let first = h.manager.connect(&h.config, &h.session).await.unwrap();
        let second = h.manager.connect(&h.config, &h.session).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_dial() {
        let h = harness_with(
            StubFactory::new(&[]).with_open_delay(Duration::from_millis(20)),
            CountingAuth::default(),
        );
        let (a, b) = tokio::join!(
            h.manager.connect(&h.config, &h.session),
            h.manager.connect(&h.config, &h.session),
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.auth.fetches.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn disconnected_connection_is_replaced_on_next_connect() {
        let h = harness(&[]);
        let first = h.manager.connect(&h.config, &h.session).await.unwrap();
        first.dispose().await;

        let second = h.manager.connect(&h.config, &h.session).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(h.factory.created(), 2);
    }

    #[tokio::test]
    async fn open_403_refetches_credential_once_and_redials() {
        let h = harness(&[403, 200]);
        let connection = h.manager.connect(&h.config, &h.session).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.auth.fetches.load(Ordering::Acquire), 1);
        assert_eq!(h.auth.expiry_fetches.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn second_403_is_fatal() {
        let h = harness(&[403, 403]);
        let err = match h.manager.connect(&h.config, &h.session).await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            SessionError::ConnectionFailure { status: 403, .. }
        ));
        assert_eq!(h.auth.expiry_fetches.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn open_failure_reports_status_and_endpoint() {
        let mut h = harness(&[503]);
        h.config
            .properties
            .set(property_id::ENDPOINT, "wss://example.test/speech");

        let err = match h.manager.connect(&h.config, &h.session).await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        let message = err.to_string();
        assert!(message.contains("503"), "{message}");
        assert!(message.contains("wss://example.test/speech"), "{message}");

        // The failed attempt is not cached; the next call dials again.
        let _ = h.manager.connect(&h.config, &h.session).await;
        assert_eq!(h.factory.created(), 2);
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_and_never_dials() {
        let h = harness_with(
            StubFactory::new(&[]),
            CountingAuth {
                fail: true,
                ..Default::default()
            },
        );
        let err = match h.manager.connect(&h.config, &h.session).await {
            Ok(_) => panic!("expected connect() to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SessionError::AuthFailure(_)));
        assert_eq!(h.factory.created(), 0);
    }
}

// =============================================================================
// Configurator
// =============================================================================

mod configurator_tests {
    use super::*;

    #[tokio::test]
    async fn configure_sends_config_then_context_and_caches() {
        let h = harness(&[]);
        let configurator = Configurator::new(ConnectionManager::new(
            h.auth.clone(),
            h.factory.clone(),
            broadcast::channel(16).0,
        ));

        let first = configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();
        let second = configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();
        assert_eq!(first.id(), second.id());

        let sent = h.factory.sent_paths();
        assert_eq!(
            sent.iter().map(|(_, p)| p.as_str()).collect::<Vec<_>>(),
            vec![PATH_SPEECH_CONFIG, PATH_SPEECH_CONTEXT],
        );
    }

    #[tokio::test]
    async fn begin_turn_resends_context_but_not_config() {
        let h = harness(&[]);
        let configurator = Configurator::new(ConnectionManager::new(
            h.auth.clone(),
            h.factory.clone(),
            broadcast::channel(16).0,
        ));

        configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();
        h.session.on_service_turn_end_response(true);
        configurator.begin_turn().await;
        configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();

        let paths: Vec<String> = h.factory.sent_paths().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            paths,
            vec![PATH_SPEECH_CONFIG, PATH_SPEECH_CONTEXT, PATH_SPEECH_CONTEXT],
        );
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn reset_forces_config_and_context_again() {
        let h = harness(&[]);
        let configurator = Configurator::new(ConnectionManager::new(
            h.auth.clone(),
            h.factory.clone(),
            broadcast::channel(16).0,
        ));

        configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();
        configurator.reset().await;
        configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();

        let paths: Vec<String> = h.factory.sent_paths().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            paths,
            vec![
                PATH_SPEECH_CONFIG,
                PATH_SPEECH_CONTEXT,
                PATH_SPEECH_CONFIG,
                PATH_SPEECH_CONTEXT,
            ],
        );
    }

    #[tokio::test]
    async fn replaced_connection_gets_the_full_handshake() {
        let h = harness(&[]);
        let configurator = Configurator::new(ConnectionManager::new(
            h.auth.clone(),
            h.factory.clone(),
            broadcast::channel(16).0,
        ));

        let first = configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();
        first.dispose().await;

        let second = configurator
            .configure(&h.config, &h.session, || Ok(payloads_for(&h.session)))
            .await
            .unwrap();
        assert_ne!(first.id(), second.id());

        let sent = h.factory.sent_paths();
        let on_second: Vec<&str> = sent
            .iter()
            .filter(|(id, _)| id == second.id())
            .map(|(_, p)| p.as_str())
            .collect();
        assert_eq!(on_second, vec![PATH_SPEECH_CONFIG, PATH_SPEECH_CONTEXT]);
    }
}
