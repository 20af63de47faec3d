//! In-memory mock of the speech service transport.
//!
//! Simulates the service side of the duplex channel: scripted open statuses
//! (for the 403 re-auth path), turn announcements in response to audio,
//! phrase/end replies on end-of-audio, server-driven turn endings, and
//! mid-stream connection drops. Frames sent by the core are logged with the
//! sending connection's index and a timestamp so tests can assert ordering
//! and pacing.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use speech_session::config::property_id;
use speech_session::{
    AudioStreamFormat, AuthInfo, AuthProvider, CancellationDetails, Connection, ConnectionEvent,
    ConnectionFactory, ConnectionState, MessageContext, OpenResponse, PushAudioSource, RawMessage,
    RecognitionHandler, RecognitionMode, RecognizerConfig, RecognitionSettings, SessionCore,
    SessionError, SessionEvent,
};

// =============================================================================
// Scripted service
// =============================================================================

/// One frame the core handed to a connection.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub connection_index: usize,
    pub message: RawMessage,
    pub at: Instant,
}

/// Shared service state across every connection a test dials.
#[derive(Default)]
pub struct MockService {
    /// Open handshake status per created connection; 200 once exhausted.
    pub open_statuses: Mutex<VecDeque<u16>>,
    /// Drop connection `index` after it has accepted this many audio data
    /// frames; the triggering frame is lost in flight.
    pub drop_connection_after_frames: Option<(usize, usize)>,
    /// End the first turn server-side once this many audio bytes arrived,
    /// without waiting for end-of-audio. Later turns run to end-of-audio.
    pub end_first_turn_after_bytes: Option<u64>,
    pub sent: Mutex<Vec<SentFrame>>,
    pub created: AtomicUsize,
    pub first_turn_ended: Mutex<bool>,
}

impl MockService {
    pub fn with_open_statuses(statuses: &[u16]) -> Self {
        Self {
            open_statuses: Mutex::new(statuses.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn connections_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }

    /// Paths of every sent frame, in order.
    pub fn sent_paths(&self) -> Vec<String> {
        self.sent().iter().map(|f| f.message.path.clone()).collect()
    }

    pub fn count_path(&self, path: &str) -> usize {
        self.sent()
            .iter()
            .filter(|f| f.message.path.eq_ignore_ascii_case(path))
            .count()
    }

    /// Total audio payload bytes accepted by connection `index`.
    pub fn audio_bytes_on(&self, index: usize) -> usize {
        self.sent()
            .iter()
            .filter(|f| f.connection_index == index && f.message.path == "audio")
            .filter_map(|f| match &f.message.payload {
                speech_session::MessagePayload::Binary(Some(b)) => Some(b.len()),
                _ => None,
            })
            .sum()
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Default)]
struct TurnState {
    request_id: String,
    audio_bytes: u64,
    audio_frames: usize,
    announced: bool,
    /// Set after a server-driven turn end; audio is ignored until the next
    /// `speech.context` arrives, the way the live service drops frames that
    /// race a concluded turn.
    awaiting_context: bool,
}

pub struct MockConnection {
    id: String,
    index: usize,
    open_status: u16,
    service: Arc<MockService>,
    state: Mutex<ConnectionState>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<RawMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawMessage>>,
    events: broadcast::Sender<ConnectionEvent>,
    turn: Mutex<TurnState>,
}

impl MockConnection {
    fn push(&self, message: RawMessage) {
        let _ = self.events.send(ConnectionEvent::MessageReceived {
            connection_id: self.id.clone(),
            path: message.path.clone(),
        });
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Sever the link: frames stop flowing and pending reads drain to `None`.
    fn kill(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        self.inbound_tx.lock().take();
        let _ = self.events.send(ConnectionEvent::Closed {
            connection_id: self.id.clone(),
            status: 1006,
            reason: "connection dropped".to_string(),
        });
    }

    fn end_turn(&self, request_id: &str) {
        self.push(RawMessage::text(
            "speech.enddetected",
            request_id,
            json!({ "Offset": 10_000_000u64 }).to_string(),
        ));
        self.push(RawMessage::text("turn.end", request_id, "{}".to_string()));
    }

    fn react(&self, message: &RawMessage) {
        match message.path.to_ascii_lowercase().as_str() {
            "speech.context" => {
                let mut turn = self.turn.lock();
                turn.request_id = message.request_id.clone();
                turn.audio_bytes = 0;
                turn.announced = false;
                turn.awaiting_context = false;
            }

            "audio" if message.is_audio_end() => {
                let request_id = {
                    let turn = self.turn.lock();
                    if turn.awaiting_context {
                        return;
                    }
                    turn.request_id.clone()
                };
                self.push(RawMessage::text(
                    "speech.phrase",
                    &request_id,
                    json!({
                        "RecognitionStatus": "Success",
                        "DisplayText": "hello world",
                        "Offset": 500_000u64,
                        "Duration": 9_500_000u64,
                    })
                    .to_string(),
                ));
                self.end_turn(&request_id);
            }

            "audio" => {
                if let Some((index, frames)) = self.service.drop_connection_after_frames {
                    if index == self.index && self.turn.lock().audio_frames >= frames {
                        self.kill();
                        return;
                    }
                }

                let (announce, ended, request_id) = {
                    let mut turn = self.turn.lock();
                    if turn.awaiting_context {
                        return;
                    }
                    let announce = !turn.announced;
                    turn.announced = true;
                    turn.audio_frames += 1;
                    if let speech_session::MessagePayload::Binary(Some(bytes)) = &message.payload {
                        turn.audio_bytes += bytes.len() as u64;
                    }

                    let mut ended = false;
                    if let Some(threshold) = self.service.end_first_turn_after_bytes {
                        let mut first_turn_ended = self.service.first_turn_ended.lock();
                        if !*first_turn_ended && turn.audio_bytes >= threshold {
                            *first_turn_ended = true;
                            turn.awaiting_context = true;
                            ended = true;
                        }
                    }
                    (announce, ended, turn.request_id.clone())
                };

                if announce {
                    self.push(RawMessage::text(
                        "turn.start",
                        &request_id,
                        json!({ "context": { "serviceTag": "mock" } }).to_string(),
                    ));
                    self.push(RawMessage::text(
                        "speech.startdetected",
                        &request_id,
                        json!({ "Offset": 0 }).to_string(),
                    ));
                }
                if ended {
                    self.end_turn(&request_id);
                }
            }

            _ => {}
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn open(&self) -> Result<OpenResponse, SessionError> {
        if self.open_status == 200 {
            *self.state.lock() = ConnectionState::Connected;
            let _ = self.events.send(ConnectionEvent::Established {
                connection_id: self.id.clone(),
            });
            Ok(OpenResponse {
                status: 200,
                reason: String::new(),
            })
        } else {
            *self.state.lock() = ConnectionState::Disconnected;
            Ok(OpenResponse {
                status: self.open_status,
                reason: "rejected by script".to_string(),
            })
        }
    }

    async fn send(&self, message: RawMessage) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::Transport(
                "connection is not open".to_string(),
            ));
        }
        self.service.sent.lock().push(SentFrame {
            connection_index: self.index,
            message: message.clone(),
            at: Instant::now(),
        });
        let _ = self.events.send(ConnectionEvent::MessageSent {
            connection_id: self.id.clone(),
            path: message.path.clone(),
        });
        self.react(&message);
        Ok(())
    }

    async fn read(&self) -> Result<Option<RawMessage>, SessionError> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) {
        self.kill();
    }
}

pub struct MockConnectionFactory {
    service: Arc<MockService>,
}

impl MockConnectionFactory {
    pub fn new(service: Arc<MockService>) -> Self {
        Self { service }
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(
        &self,
        _config: &RecognizerConfig,
        _auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        let index = self.service.created.fetch_add(1, Ordering::AcqRel);
        let open_status = self.service.open_statuses.lock().pop_front().unwrap_or(200);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(MockConnection {
            id: connection_id.to_string(),
            index,
            open_status,
            service: self.service.clone(),
            state: Mutex::new(ConnectionState::None),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            events,
            turn: Mutex::new(TurnState::default()),
        }))
    }
}

// =============================================================================
// Auth and handler doubles
// =============================================================================

#[derive(Default)]
pub struct MockAuth {
    pub fetches: AtomicUsize,
    pub expiry_fetches: AtomicUsize,
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn fetch(&self, _id: &str) -> Result<AuthInfo, SessionError> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        Ok(AuthInfo::new("Authorization", "Bearer mock-token"))
    }

    async fn fetch_on_expiry(&self, _id: &str) -> Result<AuthInfo, SessionError> {
        self.expiry_fetches.fetch_add(1, Ordering::AcqRel);
        Ok(AuthInfo::new("Authorization", "Bearer fresh-mock-token"))
    }
}

/// Handler that records delegated messages and cancellations.
#[derive(Default)]
pub struct CollectingHandler {
    pub messages: Mutex<Vec<RawMessage>>,
    pub cancellations: Mutex<Vec<CancellationDetails>>,
}

impl CollectingHandler {
    pub fn phrases(&self) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.path.eq_ignore_ascii_case("speech.phrase"))
            .count()
    }
}

#[async_trait]
impl RecognitionHandler for CollectingHandler {
    async fn process_message(
        &self,
        message: RawMessage,
        _context: &MessageContext,
    ) -> Result<(), SessionError> {
        self.messages.lock().push(message);
        Ok(())
    }

    async fn cancel_recognition(&self, details: CancellationDetails) {
        self.cancellations.lock().push(details);
    }
}

// =============================================================================
// Test rig
// =============================================================================

pub struct TestRig {
    pub core: Arc<SessionCore>,
    pub service: Arc<MockService>,
    pub auth: Arc<MockAuth>,
    pub handler: Arc<CollectingHandler>,
    pub source: Arc<PushAudioSource>,
}

pub struct RigBuilder {
    service: Arc<MockService>,
    telemetry_enabled: bool,
    throttle_ms: Option<String>,
    realtime: bool,
}

impl RigBuilder {
    pub fn new(service: MockService) -> Self {
        Self {
            service: Arc::new(service),
            telemetry_enabled: true,
            throttle_ms: None,
            realtime: false,
        }
    }

    pub fn telemetry(mut self, enabled: bool) -> Self {
        self.telemetry_enabled = enabled;
        self
    }

    /// Override the transmit-before-throttle budget (milliseconds).
    pub fn throttle_ms(mut self, ms: &str) -> Self {
        self.throttle_ms = Some(ms.to_string());
        self
    }

    pub fn realtime_source(mut self) -> Self {
        self.realtime = true;
        self
    }

    pub fn build(self) -> TestRig {
        let mut config = RecognizerConfig::new(RecognitionSettings {
            language: Some("en-US".to_string()),
            ..Default::default()
        });
        config.telemetry_enabled = self.telemetry_enabled;
        config.properties.set(property_id::REGION, "westus");
        if let Some(ms) = &self.throttle_ms {
            config
                .properties
                .set(property_id::TRANSMIT_LENGTH_BEFORE_THROTTLE_MS, ms.clone());
        }

        let mut source = PushAudioSource::new(AudioStreamFormat::pcm_16khz_16bit_mono());
        if self.realtime {
            source = source.realtime();
        }
        let source = Arc::new(source);

        let auth = Arc::new(MockAuth::default());
        let handler = Arc::new(CollectingHandler::default());
        let core = Arc::new(
            SessionCore::new(
                config,
                auth.clone(),
                Arc::new(MockConnectionFactory::new(self.service.clone())),
                source.clone(),
                handler.clone(),
            )
            .expect("core construction"),
        );

        TestRig {
            core,
            service: self.service,
            auth,
            handler,
            source,
        }
    }
}

pub fn rig(service: MockService) -> TestRig {
    RigBuilder::new(service).build()
}

/// Drain every buffered session event.
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Run a single-shot recognition over `bytes` of audio and wait for it.
pub async fn run_single_shot(rig: &TestRig, bytes: usize) -> Result<bool, SessionError> {
    rig.source.write(vec![0u8; bytes].into());
    rig.source.close();
    rig.core.recognize(RecognitionMode::SingleShot).await
}
