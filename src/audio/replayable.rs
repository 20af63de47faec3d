//! Replayable wrapper over an attached audio stream.
//!
//! The upstream pump may lose a connection after audio has already been read
//! off the source. This wrapper retains a bounded window of recently-read
//! chunks so a transparent redial can re-send them; the pump calls
//! [`ReplayableAudioStream::rewind`] when it observes a new connection
//! identity, and [`ReplayableAudioStream::shrink_past`] once the service has
//! acknowledged audio beyond an offset.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::SessionError;

use super::{AudioChunk, AudioStreamNode};

/// A buffered chunk together with its absolute byte offset in the stream.
#[derive(Debug, Clone)]
struct WindowChunk {
    start_offset: u64,
    buffer: Bytes,
}

/// Wraps a raw [`AudioStreamNode`] with a bounded replay window.
pub struct ReplayableAudioStream {
    inner: Box<dyn AudioStreamNode>,
    /// Recently-read chunks, oldest first. Total size bounded by `capacity`.
    window: VecDeque<WindowChunk>,
    buffered_bytes: usize,
    /// Bytes the window may retain; the transmit-before-throttle budget.
    capacity: usize,
    /// Chunks queued for re-delivery after a rewind.
    replay: VecDeque<Bytes>,
    /// Absolute offset of the next fresh byte read from the source.
    read_offset: u64,
    ended: bool,
}

impl ReplayableAudioStream {
    pub fn new(inner: Box<dyn AudioStreamNode>, capacity: usize) -> Self {
        Self {
            inner,
            window: VecDeque::new(),
            buffered_bytes: 0,
            capacity,
            replay: VecDeque::new(),
            read_offset: 0,
            ended: false,
        }
    }

    /// Id of the underlying attachment.
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Read the next chunk: queued replay data first, then the source.
    pub async fn read(&mut self) -> Result<AudioChunk, SessionError> {
        if let Some(buffer) = self.replay.pop_front() {
            return Ok(AudioChunk::data(buffer));
        }
        if self.ended {
            return Ok(AudioChunk::end());
        }

        let chunk = self.inner.read().await?;
        if chunk.is_end {
            self.ended = true;
            return Ok(chunk);
        }

        self.retain(chunk.buffer.clone());
        self.read_offset += chunk.buffer.len() as u64;
        Ok(chunk)
    }

    /// Queue the retained window for re-delivery. Called by the pump after a
    /// reconnect so the replacement connection sees the lost audio again.
    pub fn rewind(&mut self) {
        self.replay = self.window.iter().map(|c| c.buffer.clone()).collect();
    }

    /// Drop retained chunks wholly acknowledged by the service.
    pub fn shrink_past(&mut self, acknowledged_offset: u64) {
        while let Some(front) = self.window.front() {
            if front.start_offset + front.buffer.len() as u64 <= acknowledged_offset {
                self.buffered_bytes -= front.buffer.len();
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes currently retained for replay.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    fn retain(&mut self, buffer: Bytes) {
        self.buffered_bytes += buffer.len();
        self.window.push_back(WindowChunk {
            start_offset: self.read_offset,
            buffer,
        });
        while self.buffered_bytes > self.capacity {
            let Some(front) = self.window.pop_front() else {
                break;
            };
            self.buffered_bytes -= front.buffer.len();
        }
    }
}
