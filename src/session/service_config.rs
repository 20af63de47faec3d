//! The `speech.config` handshake payload.
//!
//! Sent once per physical connection before any context or audio. Describes
//! the client system, host OS, and the attached audio device. When telemetry
//! is disabled the payload is a typed reduction to
//! `{"context":{"system":...}}`, not a parse-and-strip of the full document.

use serde::Serialize;
use serde_json::json;

use crate::audio::AudioDeviceInfo;

/// Client system description.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub build: String,
    pub lang: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: "release".to_string(),
            lang: "rust".to_string(),
        }
    }
}

/// Host OS description.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OsInfo {
    pub platform: String,
    pub name: String,
    pub version: String,
}

impl OsInfo {
    fn current() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            name: std::env::consts::ARCH.to_string(),
            version: String::new(),
        }
    }
}

impl Default for OsInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// The serializable `speech.config` document.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct SpeechServiceConfig {
    system: SystemInfo,
    os: OsInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_source: Option<AudioDeviceInfo>,
}

impl SpeechServiceConfig {
    /// Config describing the current host.
    pub fn current_host() -> Self {
        Self {
            system: SystemInfo::default(),
            os: OsInfo::current(),
            audio_source: None,
        }
    }

    /// Install the attached audio device description.
    pub fn set_audio_source(&mut self, device: AudioDeviceInfo) {
        self.audio_source = Some(device);
    }

    /// Serialize for the wire. With telemetry disabled only the system
    /// context is disclosed.
    pub fn to_json(&self, telemetry_enabled: bool) -> String {
        let value = if telemetry_enabled {
            match &self.audio_source {
                Some(source) => json!({
                    "context": {
                        "system": self.system,
                        "os": self.os,
                        "audio": { "source": source },
                    }
                }),
                None => json!({
                    "context": {
                        "system": self.system,
                        "os": self.os,
                    }
                }),
            }
        } else {
            json!({ "context": { "system": self.system } })
        };
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioStreamFormat;

    #[test]
    fn full_payload_carries_system_os_and_audio() {
        let mut config = SpeechServiceConfig::current_host();
        config.set_audio_source(AudioDeviceInfo::stream(
            AudioStreamFormat::pcm_16khz_16bit_mono(),
        ));

        let parsed: serde_json::Value = serde_json::from_str(&config.to_json(true)).unwrap();
        let context = &parsed["context"];
        assert_eq!(context["system"]["lang"], "rust");
        assert!(context["os"]["platform"].is_string());
        assert_eq!(context["audio"]["source"]["samplerate"], 16_000);
        assert_eq!(context["audio"]["source"]["type"], "Stream");
    }

    #[test]
    fn disabled_telemetry_reduces_to_system_context() {
        let mut config = SpeechServiceConfig::current_host();
        config.set_audio_source(AudioDeviceInfo::stream(AudioStreamFormat::default()));

        let parsed: serde_json::Value = serde_json::from_str(&config.to_json(false)).unwrap();
        let context = parsed["context"].as_object().unwrap();
        assert_eq!(context.len(), 1);
        assert!(context.contains_key("system"));
    }
}
