//! Recognizer configuration: recognition settings, tunable properties, and
//! the assembled per-recognizer configuration handed to the session core.
//!
//! The query-parameter names emitted by [`RecognitionSettings::query_params`]
//! are contractual with the service and must not be renamed.

use std::collections::HashMap;
use std::time::Duration;

use crate::audio::AudioDeviceInfo;
use crate::session::service_config::SpeechServiceConfig;

// =============================================================================
// Recognition mode
// =============================================================================

/// Recognition mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecognitionMode {
    /// One phrase + `turn.end`, then the session stops.
    #[default]
    SingleShot,
    /// The session survives turns until stopped or audio ends.
    Continuous,
}

impl RecognitionMode {
    #[inline]
    pub fn is_continuous(&self) -> bool {
        matches!(self, Self::Continuous)
    }

    /// Path segment used when building the default endpoint URL.
    #[inline]
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Self::SingleShot => "interactive",
            Self::Continuous => "conversation",
        }
    }
}

// =============================================================================
// Output format and profanity handling
// =============================================================================

/// Result detail level requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Simple,
    Detailed,
}

impl OutputFormat {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Detailed => "detailed",
        }
    }
}

/// Profanity handling requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfanityOption {
    Masked,
    Removed,
    Raw,
}

impl ProfanityOption {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Masked => "masked",
            Self::Removed => "removed",
            Self::Raw => "raw",
        }
    }
}

// =============================================================================
// Recognition settings
// =============================================================================

/// Per-connection recognition settings, serialized as URL query parameters
/// on the service endpoint.
#[derive(Debug, Clone, Default)]
pub struct RecognitionSettings {
    /// Recognition language (BCP-47), e.g. `en-US`.
    pub language: Option<String>,
    /// Result detail level.
    pub output_format: Option<OutputFormat>,
    /// Source language for translation sessions.
    pub from_language: Option<String>,
    /// Target languages for translation sessions.
    pub to_languages: Vec<String>,
    pub profanity: Option<ProfanityOption>,
    /// Custom deployment id (`cid`).
    pub deployment_id: Option<String>,
    /// Enable service-side test hooks.
    pub test_hooks: bool,
    pub store_audio: Option<bool>,
    pub word_level_timestamps: Option<bool>,
    pub initial_silence_timeout_ms: Option<u32>,
    pub end_silence_timeout_ms: Option<u32>,
    pub stable_intermediate_threshold: Option<u32>,
    pub stable_translation: Option<bool>,
}

impl RecognitionSettings {
    /// Serialize as `(name, value)` pairs. Names are contractual.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if self.test_hooks {
            params.push(("testhooks", "true".to_string()));
        }
        if let Some(cid) = &self.deployment_id {
            params.push(("cid", cid.clone()));
        }
        if let Some(format) = self.output_format {
            params.push(("format", format.as_str().to_string()));
        }
        if let Some(language) = &self.language {
            params.push(("language", language.clone()));
        }
        if let Some(from) = &self.from_language {
            params.push(("from", from.clone()));
        }
        for to in &self.to_languages {
            params.push(("to", to.clone()));
        }
        if let Some(profanity) = self.profanity {
            params.push(("profanity", profanity.as_str().to_string()));
        }
        if let Some(store) = self.store_audio {
            params.push(("storeAudio", store.to_string()));
        }
        if let Some(wlt) = self.word_level_timestamps {
            params.push(("wordLevelTimestamps", wlt.to_string()));
        }
        if let Some(ms) = self.initial_silence_timeout_ms {
            params.push(("initialSilenceTimeoutMs", ms.to_string()));
        }
        if let Some(ms) = self.end_silence_timeout_ms {
            params.push(("endSilenceTimeoutMs", ms.to_string()));
        }
        if let Some(threshold) = self.stable_intermediate_threshold {
            params.push(("stableIntermediateThreshold", threshold.to_string()));
        }
        if let Some(stable) = self.stable_translation {
            params.push(("stableTranslation", stable.to_string()));
        }
        params
    }
}

// =============================================================================
// Property collection
// =============================================================================

/// Well-known property keys.
pub mod property_id {
    /// Milliseconds of audio sent unthrottled before real-time pacing
    /// engages. Default `"5000"`.
    pub const TRANSMIT_LENGTH_BEFORE_THROTTLE_MS: &str = "SPEECH-TransmitLengthBeforThrottleMs";
    /// Explicit service endpoint URL.
    pub const ENDPOINT: &str = "SpeechServiceConnection_Endpoint";
    /// Service region, used when no explicit endpoint is set.
    pub const REGION: &str = "SpeechServiceConnection_Region";
}

const DEFAULT_THROTTLE_MS: u64 = 5_000;

/// String-keyed tunables attached to a recognizer.
#[derive(Debug, Clone, Default)]
pub struct PropertyCollection {
    entries: HashMap<String, String>,
}

impl PropertyCollection {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

// =============================================================================
// Recognizer config
// =============================================================================

/// Complete configuration for one recognizer's session core.
#[derive(Debug, Clone, Default)]
pub struct RecognizerConfig {
    pub mode: RecognitionMode,
    pub settings: RecognitionSettings,
    pub properties: PropertyCollection,
    /// Payload sent as `speech.config`; device info is installed per
    /// recognition once the audio source is attached.
    pub speech_config: SpeechServiceConfig,
    /// When disabled, the `speech.config` payload is reduced to the system
    /// context and telemetry flushes are suppressed.
    pub telemetry_enabled: bool,
}

impl RecognizerConfig {
    pub fn new(settings: RecognitionSettings) -> Self {
        Self {
            mode: RecognitionMode::default(),
            settings,
            properties: PropertyCollection::default(),
            speech_config: SpeechServiceConfig::current_host(),
            telemetry_enabled: true,
        }
    }

    /// Configured endpoint URL, or empty when only a region is set.
    /// Used verbatim in connection-failure messages.
    pub fn endpoint(&self) -> String {
        self.properties
            .get(property_id::ENDPOINT)
            .unwrap_or_default()
            .to_string()
    }

    /// The fast-lane duration before upstream throttling engages.
    pub fn transmit_length_before_throttle(&self) -> Duration {
        let ms = self
            .properties
            .get(property_id::TRANSMIT_LENGTH_BEFORE_THROTTLE_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_THROTTLE_MS);
        Duration::from_millis(ms)
    }

    /// Install the attached device description into the handshake payload.
    pub fn install_audio_source_info(&mut self, device: AudioDeviceInfo) {
        self.speech_config.set_audio_source(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_use_contractual_names() {
        let settings = RecognitionSettings {
            language: Some("en-US".to_string()),
            output_format: Some(OutputFormat::Detailed),
            from_language: Some("en-US".to_string()),
            to_languages: vec!["de".to_string(), "fr".to_string()],
            profanity: Some(ProfanityOption::Masked),
            deployment_id: Some("deadbeef".to_string()),
            test_hooks: true,
            store_audio: Some(true),
            word_level_timestamps: Some(true),
            initial_silence_timeout_ms: Some(5_000),
            end_silence_timeout_ms: Some(1_000),
            stable_intermediate_threshold: Some(3),
            stable_translation: Some(false),
        };

        let params = settings.query_params();
        let names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "testhooks",
                "cid",
                "format",
                "language",
                "from",
                "to",
                "to",
                "profanity",
                "storeAudio",
                "wordLevelTimestamps",
                "initialSilenceTimeoutMs",
                "endSilenceTimeoutMs",
                "stableIntermediateThreshold",
                "stableTranslation",
            ]
        );
        assert!(params.contains(&("format", "detailed".to_string())));
        assert!(params.contains(&("cid", "deadbeef".to_string())));
    }

    #[test]
    fn unset_settings_emit_no_params() {
        assert!(RecognitionSettings::default().query_params().is_empty());
    }

    #[test]
    fn throttle_property_overrides_default() {
        let mut config = RecognizerConfig::new(RecognitionSettings::default());
        assert_eq!(
            config.transmit_length_before_throttle(),
            Duration::from_millis(5_000)
        );

        config
            .properties
            .set(property_id::TRANSMIT_LENGTH_BEFORE_THROTTLE_MS, "2500");
        assert_eq!(
            config.transmit_length_before_throttle(),
            Duration::from_millis(2_500)
        );

        // Unparseable values fall back to the default.
        config
            .properties
            .set(property_id::TRANSMIT_LENGTH_BEFORE_THROTTLE_MS, "fast");
        assert_eq!(
            config.transmit_length_before_throttle(),
            Duration::from_millis(5_000)
        );
    }
}
