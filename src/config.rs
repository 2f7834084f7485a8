//! Gateway configuration.
//!
//! Loaded once at startup from an optional TOML file. Every field has a
//! sensible default so the service runs unconfigured; a missing file falls
//! back to defaults (logged), a malformed one fails fast.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub audio: AudioSettings,
    pub vad: VadSettings,
    pub mcp: McpSettings,
    pub adapters: AdapterSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8765,
            max_sessions: 512,
            idle_timeout_secs: 60,
            heartbeat_interval_secs: 20,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub default_frame_duration_ms: u32,
    pub outbound_queue_depth: usize,
    pub max_utterance_secs: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            default_frame_duration_ms: crate::audio::constants::DEFAULT_FRAME_DURATION_MS,
            outbound_queue_depth: 200,
            max_utterance_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    pub energy_threshold: f32,
    pub hangover_ms: u64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self { energy_threshold: 0.02, hangover_ms: 400 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub request_timeout_secs: u64,
    pub max_pending_per_session: usize,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self { request_timeout_secs: 15, max_pending_per_session: 64 }
    }
}

/// Which adapter implementation to construct for each capability.
/// `Stub` is the in-process reference implementation (§4.4); `Remote` wires
/// up a network-backed provider whose concrete client lives outside this
/// crate's scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Stub,
    Remote,
}

impl Default for AdapterKind {
    fn default() -> Self {
        AdapterKind::Stub
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdapterSettings {
    pub stt: AdapterEndpoint,
    pub llm: AdapterEndpoint,
    pub tts: AdapterEndpoint,
    pub embedding: AdapterEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdapterEndpoint {
    pub kind: AdapterKind,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the credential — never the
    /// secret value itself.
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Text }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl GatewayConfig {
    /// Loads config from `path`. A missing file yields defaults; a present
    /// but unparsable one is an error.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|source| ConfigError::Parse { path: path.to_string(), source }),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read { path: path.to_string(), source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server.port, 8765);
        assert_eq!(cfg.audio.default_frame_duration_ms, 60);
        assert_eq!(cfg.adapters.stt.kind, AdapterKind::Stub);
    }

    #[test]
    fn bind_addr_formats_host_and_port() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server.bind_addr(), "0.0.0.0:8765");
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let toml = r#"
            [server]
            port = 9999

            [vad]
            energy_threshold = 0.05
        "#;
        let cfg: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.server.max_sessions, 512);
        assert_eq!(cfg.vad.energy_threshold, 0.05);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = GatewayConfig::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(cfg.server.port, 8765);
    }
}
