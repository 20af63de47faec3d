//! Per-recognition session state.
//!
//! Pure in-memory state shared by the upstream pump, the downstream
//! dispatcher, and the controller. All operations are short and
//! non-suspending; hot flags live in atomics, ids and telemetry behind
//! `parking_lot` locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::audio::AudioSourceEvent;
use crate::transport::ConnectionEvent;

use super::mint_id;
use super::telemetry::{TelemetryCollector, TelemetryPayload, metric_name};

/// State of one recognition request, reused across recognitions.
pub struct RequestSession {
    audio_source_id: String,
    session_id: Mutex<String>,
    request_id: Mutex<String>,
    recog_number: AtomicU32,
    bytes_sent: AtomicU64,
    /// Cumulative audio offset (100-ns ticks) across concluded turns within
    /// one continuous recognition.
    current_turn_audio_offset: AtomicU64,
    is_recognizing: AtomicBool,
    is_speech_ended: AtomicBool,
    first_audio_sent: AtomicBool,
    telemetry: Mutex<TelemetryCollector>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestSession {
    pub fn new(audio_source_id: String) -> Self {
        Self {
            audio_source_id,
            session_id: Mutex::new(mint_id()),
            request_id: Mutex::new(mint_id()),
            recog_number: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            current_turn_audio_offset: AtomicU64::new(0),
            is_recognizing: AtomicBool::new(false),
            is_speech_ended: AtomicBool::new(false),
            first_audio_sent: AtomicBool::new(false),
            telemetry: Mutex::new(TelemetryCollector::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn audio_source_id(&self) -> &str {
        &self.audio_source_id
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().clone()
    }

    pub fn request_id(&self) -> String {
        self.request_id.lock().clone()
    }

    /// Monotonic recognition counter; captured by the pump to detect
    /// supersession.
    pub fn recog_number(&self) -> u32 {
        self.recog_number.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    pub fn current_turn_audio_offset(&self) -> u64 {
        self.current_turn_audio_offset.load(Ordering::Acquire)
    }

    pub fn is_recognizing(&self) -> bool {
        self.is_recognizing.load(Ordering::Acquire)
    }

    pub fn is_speech_ended(&self) -> bool {
        self.is_speech_ended.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Reset for a fresh recognition: new ids, cleared counters and flags,
    /// incremented `recog_number` so an in-flight pump from the previous
    /// recognition exits at its next checkpoint.
    pub fn start_new_recognition(&self) {
        *self.session_id.lock() = mint_id();
        *self.request_id.lock() = mint_id();
        self.recog_number.fetch_add(1, Ordering::AcqRel);
        self.bytes_sent.store(0, Ordering::Release);
        self.current_turn_audio_offset.store(0, Ordering::Release);
        self.is_recognizing.store(true, Ordering::Release);
        self.is_speech_ended.store(false, Ordering::Release);
        self.first_audio_sent.store(false, Ordering::Release);
        let mut telemetry = self.telemetry.lock();
        let _ = telemetry.take();
        telemetry.phase_start(metric_name::LISTENING_TRIGGER, None);
        debug!(session_id = %self.session_id(), "started new recognition");
    }

    pub fn on_pre_connection_start(&self, auth_fetch_event_id: &str, connection_id: &str) {
        let mut telemetry = self.telemetry.lock();
        telemetry.phase_start(metric_name::AUTHENTICATION, Some(auth_fetch_event_id));
        telemetry.phase_start(metric_name::CONNECTION, Some(connection_id));
    }

    pub fn on_auth_completed(&self, failed: bool, error: Option<&str>) {
        self.telemetry.lock().phase_end(
            metric_name::AUTHENTICATION,
            if failed { error.or(Some("failed")) } else { None },
        );
    }

    pub fn on_connection_establish_completed(&self, status: u16, reason: Option<&str>) {
        let error = (status != 200).then(|| match reason {
            Some(reason) => format!("{status}: {reason}"),
            None => status.to_string(),
        });
        self.telemetry
            .lock()
            .phase_end(metric_name::CONNECTION, error.as_deref());
    }

    pub fn on_audio_source_attach_completed(&self, audio_node_id: &str, is_replay: bool) {
        debug!(audio_node_id, is_replay, "audio node attached");
        self.telemetry.lock().record_event(if is_replay {
            "AudioNodeReattached"
        } else {
            "AudioNodeAttached"
        });
    }

    pub fn on_audio_sent(&self, byte_count: usize) {
        self.bytes_sent
            .fetch_add(byte_count as u64, Ordering::AcqRel);
        if !self.first_audio_sent.swap(true, Ordering::AcqRel) {
            self.telemetry
                .lock()
                .phase_start(metric_name::MICROPHONE, None);
        }
    }

    /// Advance the cumulative turn offset; continuous mode only, on
    /// `speech.enddetected`.
    pub fn on_service_recognized(&self, offset_ticks: u64) {
        self.current_turn_audio_offset
            .fetch_add(offset_ticks, Ordering::AcqRel);
    }

    /// Conclude the current turn. In continuous mode with audio still
    /// flowing, begins a new turn: fresh `request_id`, per-turn counters
    /// reset, cumulative offset retained. Otherwise the recognition is over.
    pub fn on_service_turn_end_response(&self, continuous: bool) {
        if continuous && !self.is_speech_ended() {
            *self.request_id.lock() = mint_id();
            self.bytes_sent.store(0, Ordering::Release);
            self.first_audio_sent.store(false, Ordering::Release);
        } else {
            self.is_recognizing.store(false, Ordering::Release);
        }
    }

    pub fn on_speech_ended(&self) {
        self.is_speech_ended.store(true, Ordering::Release);
        self.telemetry.lock().phase_end(metric_name::MICROPHONE, None);
    }

    pub fn on_stop_recognizing(&self) {
        self.is_recognizing.store(false, Ordering::Release);
    }

    /// Stop listeners and mark the recognition over.
    pub fn dispose(&self) {
        self.is_recognizing.store(false, Ordering::Release);
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Telemetry
    // -------------------------------------------------------------------------

    /// Subscribe to a connection's event stream, recording each event.
    pub fn listen_for_service_telemetry(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => session.telemetry.lock().record_event(event.name()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.lock().push(handle);
    }

    /// Subscribe to audio-source lifecycle events, recording each event.
    pub fn listen_for_audio_events(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<AudioSourceEvent>,
    ) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => session.telemetry.lock().record_event(event.name()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.lock().push(handle);
    }

    /// Record the arrival of a service message.
    pub fn on_message_received(&self, path: &str) {
        self.telemetry.lock().record_received(path);
    }

    /// Take the accumulated telemetry; `None` when nothing was recorded.
    pub fn take_telemetry(&self) -> Option<TelemetryPayload> {
        self.telemetry.lock().take()
    }
}
