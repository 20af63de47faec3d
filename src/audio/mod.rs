//! Audio source abstractions consumed by the session core.
//!
//! Capture and decoding live outside this crate. The core only needs:
//!
//! - a stream of binary chunks with format metadata ([`AudioStreamNode`]),
//! - device information for the `speech.config` handshake payload,
//! - a realtime flag that decides the upstream pacing discipline,
//! - capture-side lifecycle events recorded into session telemetry.
//!
//! [`PushAudioSource`] is a small in-memory implementation for callers that
//! feed audio themselves (and for tests).

mod replayable;

pub use self::replayable::ReplayableAudioStream;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Notify, broadcast};

use crate::error::SessionError;

// =============================================================================
// Format and device metadata
// =============================================================================

/// PCM stream format of an audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamFormat {
    pub samples_per_sec: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl AudioStreamFormat {
    /// 16 kHz, 16-bit, mono. The service's preferred input format.
    pub const fn pcm_16khz_16bit_mono() -> Self {
        Self {
            samples_per_sec: 16_000,
            bits_per_sample: 16,
            channels: 1,
        }
    }

    /// Nominal byte rate, used by the upstream pump for pacing.
    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.samples_per_sec * u32::from(self.bits_per_sample / 8) * u32::from(self.channels)
    }
}

impl Default for AudioStreamFormat {
    fn default() -> Self {
        Self::pcm_16khz_16bit_mono()
    }
}

/// Device description installed into the `speech.config` payload under
/// `context.audio.source`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    #[serde(rename = "bitspersample")]
    pub bits_per_sample: u16,
    #[serde(rename = "channelcount")]
    pub channels: u16,
    #[serde(rename = "samplerate")]
    pub samples_per_sec: u32,
    #[serde(rename = "connectivity", skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<String>,
    #[serde(rename = "manufacturer", skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(rename = "model", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl AudioDeviceInfo {
    /// Describe a non-device source such as a file or in-memory stream.
    pub fn stream(format: AudioStreamFormat) -> Self {
        Self {
            bits_per_sample: format.bits_per_sample,
            channels: format.channels,
            samples_per_sec: format.samples_per_sec,
            connectivity: None,
            manufacturer: None,
            model: None,
            kind: "Stream".to_string(),
        }
    }
}

// =============================================================================
// Stream traits
// =============================================================================

/// One read from an audio stream node.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub buffer: Bytes,
    /// End-of-stream marker. The buffer of an end chunk is empty.
    pub is_end: bool,
}

impl AudioChunk {
    pub fn data(buffer: Bytes) -> Self {
        Self {
            buffer,
            is_end: false,
        }
    }

    pub fn end() -> Self {
        Self {
            buffer: Bytes::new(),
            is_end: true,
        }
    }
}

/// An attached, readable audio stream.
#[async_trait]
pub trait AudioStreamNode: Send {
    /// Stable id of the attachment, minted per attach.
    fn id(&self) -> &str;

    /// Read the next chunk. Suspends until data or end-of-stream.
    async fn read(&mut self) -> Result<AudioChunk, SessionError>;
}

/// Capture-side lifecycle events, recorded into session telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSourceEvent {
    SourceReady,
    NodeAttached { audio_node_id: String },
    NodeDetached { audio_node_id: String },
    SourceOff,
    SourceError { message: String },
}

impl AudioSourceEvent {
    /// Telemetry name for the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceReady => "AudioSourceReady",
            Self::NodeAttached { .. } => "AudioNodeAttached",
            Self::NodeDetached { .. } => "AudioNodeDetached",
            Self::SourceOff => "AudioSourceOff",
            Self::SourceError { .. } => "AudioSourceError",
        }
    }
}

/// An audio source the core can attach to.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Stable source id, supplied to the request session on construction.
    fn id(&self) -> String;

    fn format(&self) -> AudioStreamFormat;

    /// Whether production is bounded by wall clock (e.g. a microphone).
    /// Realtime sources are never paced with timers.
    fn is_realtime(&self) -> bool;

    /// Attach and return a readable stream node.
    async fn attach(&self, audio_node_id: &str) -> Result<Box<dyn AudioStreamNode>, SessionError>;

    /// Device description for the configuration handshake.
    async fn device_info(&self) -> AudioDeviceInfo;

    /// Subscribe to capture-side lifecycle events.
    fn events(&self) -> broadcast::Receiver<AudioSourceEvent>;

    /// Stop capture. Attached nodes observe end-of-stream.
    async fn turn_off(&self);
}

// =============================================================================
// Push audio source
// =============================================================================

#[derive(Default)]
struct PushState {
    queue: VecDeque<Bytes>,
    closed: bool,
}

/// In-memory audio source fed by the caller.
///
/// `write` enqueues chunks, `close` marks end-of-stream. Reads suspend while
/// the queue is empty and the stream is still open.
pub struct PushAudioSource {
    id: String,
    format: AudioStreamFormat,
    realtime: bool,
    state: Arc<parking_lot::Mutex<PushState>>,
    readable: Arc<Notify>,
    events: broadcast::Sender<AudioSourceEvent>,
}

impl PushAudioSource {
    pub fn new(format: AudioStreamFormat) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            id: crate::session::mint_id(),
            format,
            realtime: false,
            state: Arc::new(parking_lot::Mutex::new(PushState::default())),
            readable: Arc::new(Notify::new()),
            events,
        }
    }

    /// Mark the source as realtime (microphone-like pacing).
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Enqueue a chunk of PCM bytes.
    pub fn write(&self, buffer: Bytes) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queue.push_back(buffer);
        drop(state);
        self.readable.notify_waiters();
    }

    /// Mark end-of-stream. Pending chunks are still delivered first.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
    }
}

struct PushStreamNode {
    id: String,
    state: Arc<parking_lot::Mutex<PushState>>,
    readable: Arc<Notify>,
}

#[async_trait]
impl AudioStreamNode for PushStreamNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&mut self) -> Result<AudioChunk, SessionError> {
        loop {
            // Register before checking so a write between the check and the
            // await is not lost.
            let mut notified = std::pin::pin!(self.readable.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(buffer) = state.queue.pop_front() {
                    return Ok(AudioChunk::data(buffer));
                }
                if state.closed {
                    return Ok(AudioChunk::end());
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl AudioSource for PushAudioSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn format(&self) -> AudioStreamFormat {
        self.format
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    async fn attach(&self, audio_node_id: &str) -> Result<Box<dyn AudioStreamNode>, SessionError> {
        let _ = self.events.send(AudioSourceEvent::NodeAttached {
            audio_node_id: audio_node_id.to_string(),
        });
        Ok(Box::new(PushStreamNode {
            id: audio_node_id.to_string(),
            state: self.state.clone(),
            readable: self.readable.clone(),
        }))
    }

    async fn device_info(&self) -> AudioDeviceInfo {
        AudioDeviceInfo::stream(self.format)
    }

    fn events(&self) -> broadcast::Receiver<AudioSourceEvent> {
        self.events.subscribe()
    }

    async fn turn_off(&self) {
        self.close();
        let _ = self.events.send(AudioSourceEvent::SourceOff);
    }
}
