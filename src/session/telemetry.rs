//! Per-recognition telemetry accumulator.
//!
//! Collects connection/auth phase timings, capture and transport events, and
//! per-path arrival times of service messages. The dispatcher flushes the
//! accumulated payload on `turn.end` and on every local cancellation; empty
//! flushes are suppressed.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One timed phase (auth fetch, connection establishment, microphone use).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Metric {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "Start")]
    pub start: String,
    #[serde(rename = "End", skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A point-in-time event observed from the transport or the audio source.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ObservedEvent {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

/// The JSON document sent on the `telemetry` path.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct TelemetryPayload {
    #[serde(rename = "ReceivedMessages")]
    pub received_messages: BTreeMap<String, Vec<String>>,
    #[serde(rename = "Metrics")]
    pub metrics: Vec<Metric>,
    #[serde(rename = "Events")]
    pub events: Vec<ObservedEvent>,
}

impl TelemetryPayload {
    pub fn is_empty(&self) -> bool {
        self.received_messages.is_empty() && self.metrics.is_empty() && self.events.is_empty()
    }
}

/// Phase metric names.
pub mod metric_name {
    pub const AUTHENTICATION: &str = "Authentication";
    pub const CONNECTION: &str = "Connection";
    pub const MICROPHONE: &str = "Microphone";
    pub const LISTENING_TRIGGER: &str = "ListeningTrigger";
}

/// Accumulates telemetry for the current turn. Cleared on every flush.
#[derive(Debug, Default)]
pub struct TelemetryCollector {
    payload: TelemetryPayload,
}

impl TelemetryCollector {
    /// Open a phase metric; closed later by [`Self::phase_end`].
    pub fn phase_start(&mut self, name: &str, id: Option<&str>) {
        self.payload.metrics.push(Metric {
            name: name.to_string(),
            id: id.map(str::to_string),
            start: now_stamp(),
            end: None,
            error: None,
        });
    }

    /// Close the most recent open phase with the given name.
    pub fn phase_end(&mut self, name: &str, error: Option<&str>) {
        if let Some(metric) = self
            .payload
            .metrics
            .iter_mut()
            .rev()
            .find(|m| m.name == name && m.end.is_none())
        {
            metric.end = Some(now_stamp());
            metric.error = error.map(str::to_string);
        }
    }

    /// Record the arrival of a service message on `path`.
    pub fn record_received(&mut self, path: &str) {
        self.payload
            .received_messages
            .entry(path.to_ascii_lowercase())
            .or_default()
            .push(now_stamp());
    }

    /// Record a transport or audio-source event by name.
    pub fn record_event(&mut self, name: &str) {
        self.payload.events.push(ObservedEvent {
            name: name.to_string(),
            timestamp: now_stamp(),
        });
    }

    /// Take the accumulated payload, clearing the collector. `None` when
    /// nothing was recorded since the last flush.
    pub fn take(&mut self) -> Option<TelemetryPayload> {
        if self.payload.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.payload))
    }
}
