//! The session controller and its two data loops.
//!
//! `recognize` sequences connection establishment and the configuration
//! handshake, then drives the upstream audio pump and the downstream
//! dispatcher concurrently; both terminate into the same completion. The
//! loops are recursion-free and check their termination predicates at every
//! suspension boundary, so cancellation and supersession are observed within
//! one scheduling turn.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioSource, AudioStreamFormat, ReplayableAudioStream};
use crate::auth::AuthProvider;
use crate::config::{RecognitionMode, RecognizerConfig};
use crate::error::SessionError;
use crate::transport::message::PATH_TELEMETRY;
use crate::transport::{Connection, ConnectionEvent, ConnectionFactory, RawMessage};

use super::connection_manager::{ConfigurePayloads, ConnectionManager, Configurator};
use super::context::{DynamicGrammarBuilder, SpeechContext};
use super::events::SessionEvent;
use super::handler::{
    CancellationDetails, CancellationErrorCode, CancellationReason, MessageContext,
    RecognitionHandler,
};
use super::mint_id;
use super::request_session::RequestSession;

/// 100-ns ticks per second; service offsets are expressed in ticks.
const TICKS_PER_SECOND: u64 = 10_000_000;

/// Inbound control paths handled by the dispatcher itself.
mod inbound_path {
    pub const TURN_START: &str = "turn.start";
    pub const TURN_END: &str = "turn.end";
    pub const SPEECH_START_DETECTED: &str = "speech.startdetected";
    pub const SPEECH_END_DETECTED: &str = "speech.enddetected";
}

type SharedAudioStream = Arc<tokio::sync::Mutex<ReplayableAudioStream>>;

/// Client-side engine for one recognizer's service session.
pub struct SessionCore {
    config: RwLock<RecognizerConfig>,
    audio_source: Arc<dyn AudioSource>,
    handler: Arc<dyn RecognitionHandler>,
    session: Arc<RequestSession>,
    configurator: Configurator,
    speech_context: Mutex<SpeechContext>,
    dynamic_grammar: Mutex<DynamicGrammarBuilder>,
    session_events: broadcast::Sender<SessionEvent>,
    connection_events: broadcast::Sender<ConnectionEvent>,
    /// Wakes blocked loop suspensions on cancellation or supersession.
    cancel_notify: Notify,
    disposed: AtomicBool,
    /// The attached replayable stream for the active recognition; the
    /// dispatcher shrinks its window as the service acknowledges audio.
    audio_stream: Mutex<Option<SharedAudioStream>>,
}

impl SessionCore {
    pub fn new(
        config: RecognizerConfig,
        auth: Arc<dyn AuthProvider>,
        connection_factory: Arc<dyn ConnectionFactory>,
        audio_source: Arc<dyn AudioSource>,
        handler: Arc<dyn RecognitionHandler>,
    ) -> Result<Self, SessionError> {
        let audio_source_id = audio_source.id();
        if audio_source_id.is_empty() {
            return Err(SessionError::ArgumentNull("audio_source"));
        }

        let (session_events, _) = broadcast::channel(64);
        let (connection_events, _) = broadcast::channel(256);
        let manager = ConnectionManager::new(auth, connection_factory, connection_events.clone());

        Ok(Self {
            config: RwLock::new(config),
            audio_source,
            handler,
            session: Arc::new(RequestSession::new(audio_source_id)),
            configurator: Configurator::new(manager),
            speech_context: Mutex::new(SpeechContext::new()),
            dynamic_grammar: Mutex::new(DynamicGrammarBuilder::new()),
            session_events,
            connection_events,
            cancel_notify: Notify::new(),
            disposed: AtomicBool::new(false),
            audio_stream: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Surface
    // -------------------------------------------------------------------------

    /// Subscribe to session lifecycle and speech-boundary events.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    /// Subscribe to transport events forwarded from every connection.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_events.subscribe()
    }

    /// The shared per-recognition session state.
    pub fn request_session(&self) -> &Arc<RequestSession> {
        &self.session
    }

    /// Add a phrase hint to the dynamic grammar sent with each turn.
    pub fn add_phrase(&self, phrase: impl Into<String>) {
        self.dynamic_grammar.lock().add_phrase(phrase);
    }

    /// Reference a server-side grammar in the dynamic grammar.
    pub fn add_reference_grammar(&self, grammar_id: impl Into<String>) {
        self.dynamic_grammar.lock().add_reference_grammar(grammar_id);
    }

    /// Install a named section into the per-turn `speech.context` document.
    pub fn set_context_section(&self, name: impl Into<String>, value: Value) {
        self.speech_context.lock().set_section(name, value);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// Run one recognition. Resolves once the session (continuous) or turn
    /// (single-shot) has ended and both data loops have settled.
    ///
    /// Calling this while a prior recognition is active supersedes it: the
    /// prior pump and dispatcher exit at their next checkpoint without
    /// emitting another frame.
    pub async fn recognize(&self, mode: RecognitionMode) -> Result<bool, SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }

        // Force config + context onto the wire for the new recognition.
        self.configurator.reset().await;
        self.config.write().mode = mode;
        self.session.start_new_recognition();
        // Wake any loops belonging to a superseded recognition.
        self.cancel_notify.notify_waiters();
        self.session
            .listen_for_audio_events(self.audio_source.events());

        // Dial while the audio source attaches; a dial failure here is
        // surfaced by the configure step below, not swallowed.
        let audio_node_id = mint_id();
        let warmup = async {
            let config = self.config.read().clone();
            if let Err(e) = self
                .configurator
                .manager()
                .connect(&config, &self.session)
                .await
            {
                debug!("eager connect failed, configure will retry and surface it: {e}");
            }
        };
        let (node, ()) = tokio::join!(self.audio_source.attach(&audio_node_id), warmup);
        let node = match node {
            Ok(node) => node,
            Err(e) => {
                let message = e.to_string();
                self.cancel_recognition_local(
                    CancellationReason::Error,
                    CancellationErrorCode::ConnectionFailure,
                    &message,
                )
                .await;
                return Err(e);
            }
        };

        let format = self.audio_source.format();
        let replay_capacity = {
            let config = self.config.read();
            (u64::from(format.avg_bytes_per_sec())
                * config.transmit_length_before_throttle().as_millis() as u64
                / 1000) as usize
        };
        let stream = Arc::new(tokio::sync::Mutex::new(ReplayableAudioStream::new(
            node,
            replay_capacity,
        )));
        *self.audio_stream.lock() = Some(stream.clone());
        self.session
            .on_audio_source_attach_completed(&audio_node_id, false);

        let device = self.audio_source.device_info().await;
        self.config.write().install_audio_source_info(device);

        if let Err(e) = self.fetch_connection().await {
            let message = e.to_string();
            let code = match &e {
                SessionError::AuthFailure(_) => CancellationErrorCode::AuthenticationFailure,
                _ => CancellationErrorCode::ConnectionFailure,
            };
            self.cancel_recognition_local(CancellationReason::Error, code, &message)
                .await;
            return Err(e);
        }

        let session_id = self.session.session_id();
        info!(session_id = %session_id, "session started");
        let _ = self
            .session_events
            .send(SessionEvent::SessionStarted { session_id });

        let start_recog_number = self.session.recog_number();
        let realtime = self.audio_source.is_realtime();
        let (receive_result, pump_result) = tokio::join!(
            self.receive_loop(start_recog_number),
            self.audio_pump(stream, start_recog_number, format, realtime),
        );

        if let Err(e) = pump_result {
            let message = e.to_string();
            self.cancel_recognition_local(
                CancellationReason::Error,
                CancellationErrorCode::RuntimeError,
                &message,
            )
            .await;
            return Err(e);
        }
        match receive_result {
            Ok(done) => Ok(done),
            Err(e) => {
                let message = e.to_string();
                self.cancel_recognition_local(
                    CancellationReason::Error,
                    CancellationErrorCode::RuntimeError,
                    &message,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Stop the active recognition: flush telemetry, close out the audio
    /// stream service-side, and retire the session state.
    pub async fn stop_recognizing(&self) -> Result<(), SessionError> {
        if !self.session.is_recognizing() {
            return Ok(());
        }
        self.session.on_stop_recognizing();
        self.cancel_notify.notify_waiters();

        let connection = self.configurator.current().await;
        self.flush_telemetry(connection.as_ref()).await;
        self.audio_source.turn_off().await;
        if let Some(connection) = &connection {
            if let Err(e) = connection
                .send(RawMessage::audio(&self.session.request_id(), None))
                .await
            {
                warn!("end-of-audio frame was not delivered on stop: {e}");
            }
        }
        self.session.dispose();
        info!(session_id = %self.session.session_id(), "recognition stopped");
        Ok(())
    }

    /// Eagerly establish the connection without starting a recognition.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let config = self.config.read().clone();
        self.configurator
            .manager()
            .connect(&config, &self.session)
            .await
            .map(|_| ())
    }

    /// Tear down the stored connection, cancelling any active recognition.
    pub async fn disconnect(&self) {
        self.cancel_recognition_local(
            CancellationReason::Error,
            CancellationErrorCode::NoError,
            "Disconnecting",
        )
        .await;
        self.configurator.reset().await;
        self.configurator.manager().dispose_current().await;
    }

    /// Cancel the active recognition locally and report it through the
    /// handler's structured cancellation path.
    pub async fn cancel_recognition_local(
        &self,
        reason: CancellationReason,
        code: CancellationErrorCode,
        message: &str,
    ) {
        if !self.session.is_recognizing() {
            return;
        }
        self.session.on_stop_recognizing();
        self.cancel_notify.notify_waiters();

        let connection = self.configurator.current().await;
        self.flush_telemetry(connection.as_ref()).await;

        debug!(?reason, ?code, message, "recognition cancelled locally");
        self.handler
            .cancel_recognition(CancellationDetails {
                session_id: self.session.session_id(),
                request_id: self.session.request_id(),
                reason,
                code,
                message: message.to_string(),
            })
            .await;
    }

    /// Mark the core disposed and release the stored connection. Both loops
    /// observe the flag at their next checkpoint.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
        self.session.dispose();
        self.configurator.reset().await;
        self.configurator.manager().dispose_current().await;
    }

    // -------------------------------------------------------------------------
    // Configuration handshake
    // -------------------------------------------------------------------------

    fn build_payloads(&self) -> Result<ConfigurePayloads, SessionError> {
        let config = self.config.read();
        Ok(ConfigurePayloads {
            request_id: self.session.request_id(),
            config_json: config.speech_config.to_json(config.telemetry_enabled),
            context_json: self
                .speech_context
                .lock()
                .to_json(&self.dynamic_grammar.lock()),
        })
    }

    /// The configured connection; dials and re-runs the handshake as needed.
    async fn fetch_connection(&self) -> Result<Arc<dyn Connection>, SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        let config = self.config.read().clone();
        self.configurator
            .configure(&config, &self.session, || self.build_payloads())
            .await
    }

    // -------------------------------------------------------------------------
    // Upstream pump
    // -------------------------------------------------------------------------

    fn pump_should_exit(&self, start_recog_number: u32) -> bool {
        self.is_disposed()
            || self.session.is_speech_ended()
            || !self.session.is_recognizing()
            || self.session.recog_number() != start_recog_number
    }

    /// Read-and-upload cycle: stream audio chunks as binary frames until
    /// end-of-stream, cancellation, or supersession.
    async fn audio_pump(
        &self,
        stream: SharedAudioStream,
        start_recog_number: u32,
        format: AudioStreamFormat,
        realtime: bool,
    ) -> Result<(), SessionError> {
        let avg_bytes_per_sec = u64::from(format.avg_bytes_per_sec());
        let fast_lane = self.config.read().transmit_length_before_throttle();
        let max_unthrottled = avg_bytes_per_sec * fast_lane.as_millis() as u64 / 1000;
        let mut next_send_time = Instant::now();
        let mut current_connection_id: Option<String> = None;

        loop {
            let mut cancelled = pin!(self.cancel_notify.notified());
            cancelled.as_mut().enable();

            if self.pump_should_exit(start_recog_number) {
                return Ok(());
            }

            let connection = self.fetch_connection().await?;
            if current_connection_id.as_deref() != Some(connection.id()) {
                if current_connection_id.is_some() {
                    debug!(connection_id = %connection.id(), "connection replaced; replaying buffered audio");
                    stream.lock().await.rewind();
                }
                current_connection_id = Some(connection.id().to_string());
            }

            let read = async {
                let mut stream = stream.lock().await;
                stream.read().await
            };
            let chunk = tokio::select! {
                chunk = read => match chunk {
                    Ok(chunk) => chunk,
                    // After end-of-stream, a failing read is a drain
                    // artifact of the closing source, not an error.
                    Err(_) if self.session.is_speech_ended() => return Ok(()),
                    Err(e) => return Err(e),
                },
                _ = &mut cancelled => continue,
            };

            // A stop or supersession that landed during the read must not
            // emit another frame.
            if self.pump_should_exit(start_recog_number) {
                return Ok(());
            }

            if chunk.is_end {
                let request_id = self.session.request_id();
                connection.send(RawMessage::audio(&request_id, None)).await?;
                self.session.on_speech_ended();
                debug!("audio stream ended; end-of-audio sent");
                return Ok(());
            }

            // Fast lane first, then real-time pacing. Realtime devices are
            // never delayed: a coalesced timer in a backgrounded host would
            // starve the pump and inflate latency without bound.
            if !realtime && self.session.bytes_sent() > max_unthrottled {
                let now = Instant::now();
                if next_send_time > now {
                    tokio::select! {
                        _ = tokio::time::sleep_until(next_send_time) => {}
                        _ = &mut cancelled => continue,
                    }
                }
                if self.pump_should_exit(start_recog_number) {
                    return Ok(());
                }
            }

            // Stamp the frame with the request id as of the send itself; a
            // turn that concluded during the pacing sleep supplies the new
            // turn's id.
            let request_id = self.session.request_id();
            let payload_len = chunk.buffer.len();
            connection
                .send(RawMessage::audio(&request_id, Some(chunk.buffer)))
                .await?;
            self.session.on_audio_sent(payload_len);
            // Target twice real-time; the factor keeps a mild prefetch ahead
            // of the service.
            next_send_time = Instant::now()
                + Duration::from_millis(payload_len as u64 * 1000 / (avg_bytes_per_sec * 2));
        }
    }

    // -------------------------------------------------------------------------
    // Downstream dispatcher
    // -------------------------------------------------------------------------

    /// Read loop: dispatch protocol control messages, delegate everything
    /// else. Resolves when the turn (single-shot) or session (continuous)
    /// ends, or when the core is disposed or superseded.
    async fn receive_loop(&self, start_recog_number: u32) -> Result<bool, SessionError> {
        let mut must_report_end_of_stream = false;

        loop {
            let mut cancelled = pin!(self.cancel_notify.notified());
            cancelled.as_mut().enable();

            if self.is_disposed()
                || !self.session.is_recognizing()
                || self.session.recog_number() != start_recog_number
            {
                return Ok(true);
            }

            let connection = self.fetch_connection().await?;
            let message = tokio::select! {
                result = connection.read() => result?,
                _ = &mut cancelled => continue,
            };

            let Some(message) = message else {
                // Read queue draining; keep listening while recognizing so a
                // graceful transport drain does not end the session early.
                if self.session.is_recognizing() {
                    continue;
                }
                return Ok(true);
            };

            self.session.on_message_received(&message.path);

            let request_id = self.session.request_id();
            if !message.request_id.eq_ignore_ascii_case(&request_id) {
                debug!(path = %message.path, "dropping frame from a previous turn");
                continue;
            }

            let continuous = self.config.read().mode.is_continuous();
            match message.path.to_ascii_lowercase().as_str() {
                inbound_path::TURN_START => {
                    must_report_end_of_stream = true;
                }

                inbound_path::SPEECH_START_DETECTED => {
                    let offset = parse_offset(message.text_body());
                    let _ = self.session_events.send(SessionEvent::SpeechStartDetected {
                        session_id: self.session.session_id(),
                        offset,
                    });
                }

                inbound_path::SPEECH_END_DETECTED => {
                    let offset = parse_offset(message.text_body());
                    let absolute_offset = offset + self.session.current_turn_audio_offset();
                    if continuous {
                        self.session.on_service_recognized(offset);
                    }
                    self.shrink_replay_window(absolute_offset).await;
                    let _ = self.session_events.send(SessionEvent::SpeechEndDetected {
                        session_id: self.session.session_id(),
                        offset: absolute_offset,
                    });
                }

                inbound_path::TURN_END => {
                    self.flush_telemetry(Some(&connection)).await;

                    if self.session.is_speech_ended() && must_report_end_of_stream {
                        must_report_end_of_stream = false;
                        self.cancel_recognition_local(
                            CancellationReason::EndOfStream,
                            CancellationErrorCode::NoError,
                            "end of audio stream reached",
                        )
                        .await;
                    }

                    self.session.on_service_turn_end_response(continuous);

                    if !continuous || self.session.is_speech_ended() {
                        let session_id = self.session.session_id();
                        info!(session_id = %session_id, "session stopped");
                        let _ = self
                            .session_events
                            .send(SessionEvent::SessionStopped { session_id });
                        // Release a pump still parked on a stalled source.
                        self.cancel_notify.notify_waiters();
                        return Ok(true);
                    }

                    // Next turn: context must go out again, on whatever
                    // connection configure resolves (a silently replaced one
                    // gets config re-sent too).
                    self.configurator.begin_turn().await;
                    self.fetch_connection().await?;
                }

                _ => {
                    let context = MessageContext {
                        session_id: self.session.session_id(),
                        request_id,
                        turn_audio_offset: self.session.current_turn_audio_offset(),
                    };
                    self.handler.process_message(message, &context).await?;
                }
            }
        }
    }

    /// Drop replay-window chunks the service has acknowledged.
    async fn shrink_replay_window(&self, absolute_offset_ticks: u64) {
        let stream = self.audio_stream.lock().clone();
        if let Some(stream) = stream {
            let rate = u64::from(self.audio_source.format().avg_bytes_per_sec());
            let acknowledged_bytes =
                (u128::from(absolute_offset_ticks) * u128::from(rate) / u128::from(TICKS_PER_SECOND)) as u64;
            stream.lock().await.shrink_past(acknowledged_bytes);
        }
    }

    // -------------------------------------------------------------------------
    // Telemetry
    // -------------------------------------------------------------------------

    /// Flush accumulated telemetry to the service. The buffer is cleared
    /// either way; empty and disabled flushes send nothing.
    async fn flush_telemetry(&self, connection: Option<&Arc<dyn Connection>>) {
        let enabled = self.config.read().telemetry_enabled;
        let payload = self.session.take_telemetry();
        if !enabled {
            return;
        }
        let (Some(payload), Some(connection)) = (payload, connection) else {
            return;
        };
        match serde_json::to_string(&payload) {
            Ok(json) => {
                if let Err(e) = connection
                    .send(RawMessage::text(
                        PATH_TELEMETRY,
                        &self.session.request_id(),
                        json,
                    ))
                    .await
                {
                    warn!("telemetry flush failed: {e}");
                }
            }
            Err(e) => warn!("telemetry payload failed to serialize: {e}"),
        }
    }
}

/// Body of `speech.startdetected` / `speech.enddetected`.
#[derive(Debug, Deserialize)]
struct DetectedPayload {
    #[serde(rename = "Offset", default)]
    offset: u64,
}

/// Parse a detection offset; an absent or empty body means offset zero.
fn parse_offset(body: Option<&str>) -> u64 {
    body.filter(|body| !body.trim().is_empty())
        .and_then(|body| serde_json::from_str::<DetectedPayload>(body).ok())
        .map(|payload| payload.offset)
        .unwrap_or(0)
}
