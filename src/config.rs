//! Configuration loading and management
//!
//! Daemon settings come from the environment with defaults. The flow timing
//! policy lives in [`FlowConfig`], which can also be patched at runtime
//! through a [`FlowConfigUpdate`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or updating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set")]
    MissingHome,

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Initial timing policy for the conversation flow
    pub flow: FlowConfig,

    /// Chat endpoint used for response generation, if any
    pub chat_url: Option<String>,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME").ok_or(ConfigError::MissingHome)?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("voice-flow");

        let socket_path = data_dir.join("daemon.sock");

        let defaults = FlowConfig::default();
        let flow = FlowConfig {
            silence_threshold_ms: parse_or(
                &lookup,
                "VOICE_FLOW_SILENCE_MS",
                defaults.silence_threshold_ms,
            )?,
            minimum_speak_time_ms: parse_or(
                &lookup,
                "VOICE_FLOW_MIN_SPEAK_MS",
                defaults.minimum_speak_time_ms,
            )?,
            max_listen_time_ms: parse_or(
                &lookup,
                "VOICE_FLOW_MAX_LISTEN_MS",
                defaults.max_listen_time_ms,
            )?,
            ambient_music_enabled: parse_or(
                &lookup,
                "VOICE_FLOW_AMBIENT",
                defaults.ambient_music_enabled,
            )?,
            voice_harmony_enabled: parse_or(
                &lookup,
                "VOICE_FLOW_HARMONY",
                defaults.voice_harmony_enabled,
            )?,
            harmony_pause_ms: parse_or(
                &lookup,
                "VOICE_FLOW_HARMONY_PAUSE_MS",
                defaults.harmony_pause_ms,
            )?,
            cooldown_pause_ms: parse_or(
                &lookup,
                "VOICE_FLOW_COOLDOWN_MS",
                defaults.cooldown_pause_ms,
            )?,
            response_timeout_ms: parse_or(
                &lookup,
                "VOICE_FLOW_RESPONSE_TIMEOUT_MS",
                defaults.response_timeout_ms,
            )?,
        };
        flow.validate()?;

        let chat_url = lookup("VOICE_FLOW_CHAT_URL").filter(|url| !url.trim().is_empty());

        Ok(Self {
            socket_path,
            data_dir,
            flow,
            chat_url,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Timing policy and feature toggles for the conversation flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Wait after a valid utterance before asking for a response
    pub silence_threshold_ms: u64,
    /// Shortest utterance treated as real input
    pub minimum_speak_time_ms: u64,
    /// Longest unattended listening span before a cooldown
    pub max_listen_time_ms: u64,
    /// Play background ambience while the flow is active
    pub ambient_music_enabled: bool,
    /// Insert the Harmonizing pause after each response
    pub voice_harmony_enabled: bool,
    /// How long Harmonizing holds before listening resumes
    pub harmony_pause_ms: u64,
    /// How long the max-listen cooldown stays in Idle
    pub cooldown_pause_ms: u64,
    /// Upper bound on waiting for a response or its playback
    pub response_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 2000,
            minimum_speak_time_ms: 500,
            max_listen_time_ms: 30_000,
            ambient_music_enabled: true,
            voice_harmony_enabled: true,
            harmony_pause_ms: 500,
            cooldown_pause_ms: 2000,
            response_timeout_ms: 60_000,
        }
    }
}

impl FlowConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn minimum_speak_time(&self) -> Duration {
        Duration::from_millis(self.minimum_speak_time_ms)
    }

    pub fn max_listen_time(&self) -> Duration {
        Duration::from_millis(self.max_listen_time_ms)
    }

    pub fn harmony_pause(&self) -> Duration {
        Duration::from_millis(self.harmony_pause_ms)
    }

    pub fn cooldown_pause(&self) -> Duration {
        Duration::from_millis(self.cooldown_pause_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Reject settings that would make the flow spin or hang
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_listen_time_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "max_listen_time_ms" });
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "response_timeout_ms" });
        }
        Ok(())
    }

    /// Merge a partial update, returning the resulting config
    ///
    /// Fields absent from the update keep their current value. The result is
    /// validated; on error `self` is left as it was.
    pub fn merged(&self, update: &FlowConfigUpdate) -> Result<Self, ConfigError> {
        let merged = Self {
            silence_threshold_ms: update.silence_threshold_ms.unwrap_or(self.silence_threshold_ms),
            minimum_speak_time_ms: update
                .minimum_speak_time_ms
                .unwrap_or(self.minimum_speak_time_ms),
            max_listen_time_ms: update.max_listen_time_ms.unwrap_or(self.max_listen_time_ms),
            ambient_music_enabled: update
                .ambient_music_enabled
                .unwrap_or(self.ambient_music_enabled),
            voice_harmony_enabled: update
                .voice_harmony_enabled
                .unwrap_or(self.voice_harmony_enabled),
            harmony_pause_ms: update.harmony_pause_ms.unwrap_or(self.harmony_pause_ms),
            cooldown_pause_ms: update.cooldown_pause_ms.unwrap_or(self.cooldown_pause_ms),
            response_timeout_ms: update.response_timeout_ms.unwrap_or(self.response_timeout_ms),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Partial [`FlowConfig`] used for runtime updates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_threshold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_speak_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_listen_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambient_music_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_harmony_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmony_pause_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_pause_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_load_defaults() {
        let config = Config::from_lookup(lookup_from(&[("HOME", "/home/test")])).unwrap();
        assert!(config.socket_path.to_string_lossy().contains("voice-flow"));
        assert_eq!(config.flow, FlowConfig::default());
        assert!(config.chat_url.is_none());
    }

    #[test]
    fn test_config_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("HOME", "/home/test"),
            ("VOICE_FLOW_SILENCE_MS", "1500"),
            ("VOICE_FLOW_HARMONY", "false"),
            ("VOICE_FLOW_CHAT_URL", "http://localhost:5000/api/ai/chat"),
        ]))
        .unwrap();
        assert_eq!(config.flow.silence_threshold_ms, 1500);
        assert!(!config.flow.voice_harmony_enabled);
        assert_eq!(config.flow.minimum_speak_time_ms, 500);
        assert_eq!(
            config.chat_url.as_deref(),
            Some("http://localhost:5000/api/ai/chat")
        );
    }

    #[test]
    fn test_config_rejects_malformed_value() {
        let err = Config::from_lookup(lookup_from(&[
            ("HOME", "/home/test"),
            ("VOICE_FLOW_MIN_SPEAK_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "VOICE_FLOW_MIN_SPEAK_MS", .. }
        ));
    }

    #[test]
    fn test_config_requires_home() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingHome));
    }

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let base = FlowConfig::default();
        let update = FlowConfigUpdate {
            silence_threshold_ms: Some(750),
            voice_harmony_enabled: Some(false),
            ..Default::default()
        };
        let merged = base.merged(&update).unwrap();
        assert_eq!(merged.silence_threshold_ms, 750);
        assert!(!merged.voice_harmony_enabled);
        assert_eq!(merged.minimum_speak_time_ms, base.minimum_speak_time_ms);
        assert_eq!(merged.max_listen_time_ms, base.max_listen_time_ms);
        assert_eq!(merged.ambient_music_enabled, base.ambient_music_enabled);
    }

    #[test]
    fn test_merge_rejects_zero_max_listen() {
        let update = FlowConfigUpdate {
            max_listen_time_ms: Some(0),
            ..Default::default()
        };
        let err = FlowConfig::default().merged(&update).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration { field: "max_listen_time_ms" }));
    }

    #[test]
    fn test_update_deserializes_partial_json() {
        let update: FlowConfigUpdate =
            serde_json::from_str(r#"{"minimum_speak_time_ms":250}"#).unwrap();
        assert_eq!(update.minimum_speak_time_ms, Some(250));
        assert!(update.silence_threshold_ms.is_none());
    }
}
