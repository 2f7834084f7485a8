//! Wire envelopes (§6). Text frames carry one of these, tagged by `type`;
//! binary frames carry a raw Opus packet or a zero-length end-of-stream
//! sentinel and never touch this module.
//!
//! Each envelope is a distinct variant rather than a dynamically-typed
//! blob (§9 redesign flag); an envelope whose `type` this crate doesn't
//! recognize is routed to [`ClientEnvelope::Unknown`], logged, and
//! dropped — it never fails the session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::constants::ALLOWED_FRAME_DURATIONS_MS;
use crate::error::ProtocolError;

/// Capability flags advertised by the client at handshake. Stored as a
/// map rather than a fixed struct so a deployment can add flags this
/// crate doesn't know about without failing the handshake; the kernel
/// only ever reads `mcp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features(pub HashMap<String, bool>);

impl Features {
    pub fn mcp_enabled(&self) -> bool {
        self.0.get("mcp").copied().unwrap_or(false)
    }

    /// TTS is on by default; a client opts out explicitly with `tts:false`
    /// rather than by omitting `audio_params` (§9).
    pub fn tts_enabled(&self) -> bool {
        self.0.get("tts").copied().unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_duration: u32,
}

impl AudioParams {
    /// Validates the negotiable subset of the fixed wire profile (§9): the
    /// format/rate/channels are pinned, only frame duration is negotiable
    /// and only among 20/40/60ms.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.format != "opus" {
            return Err(ProtocolError::Malformed(format!("unsupported audio format '{}'", self.format)));
        }
        if self.sample_rate != crate::audio::constants::SAMPLE_RATE {
            return Err(ProtocolError::Malformed(format!(
                "unsupported sample_rate {}",
                self.sample_rate
            )));
        }
        if self.channels != crate::audio::constants::CHANNELS {
            return Err(ProtocolError::Malformed(format!("unsupported channel count {}", self.channels)));
        }
        if !ALLOWED_FRAME_DURATIONS_MS.contains(&self.frame_duration) {
            return Err(ProtocolError::BadFrameDuration(self.frame_duration));
        }
        Ok(())
    }
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: crate::audio::constants::SAMPLE_RATE,
            channels: crate::audio::constants::CHANNELS,
            frame_duration: crate::audio::constants::DEFAULT_FRAME_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    Auto,
    Manual,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// Envelopes the client may send (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEnvelope {
    #[serde(rename = "hello")]
    Hello {
        version: u32,
        transport: String,
        device_id: Option<String>,
        device_name: Option<String>,
        #[serde(default)]
        features: Features,
        audio_params: AudioParams,
    },

    #[serde(rename = "listen")]
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
    },

    #[serde(rename = "abort")]
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "chat")]
    Chat { text: String, state: String },

    #[serde(rename = "wake_word_detected")]
    WakeWordDetected { keyword: String, confidence: f32 },

    #[serde(rename = "iot")]
    Iot {
        #[serde(default)]
        descriptors: Option<Value>,
        #[serde(default)]
        states: Option<Value>,
    },

    #[serde(rename = "mcp")]
    Mcp { payload: Value },

    #[serde(rename = "friend")]
    Friend { clientid: String, data: Value },

    /// An envelope whose `type` tag this crate doesn't recognize. Kept as
    /// the raw tag plus a best-effort value so the caller can log it
    /// before dropping, per §9's "unknown" arm.
    #[serde(skip)]
    Unknown { tag: String, raw: Value },
}

impl ClientEnvelope {
    /// Parses a text frame, surfacing an unrecognized `type` as `Unknown`
    /// instead of a hard parse error — only a missing/malformed `type`
    /// tag or fields that fail to deserialize for a *known* type are
    /// `ProtocolError`s.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing 'type' field".to_string()))?
            .to_string();

        const KNOWN: &[&str] = &[
            "hello", "listen", "abort", "chat", "wake_word_detected", "iot", "mcp", "friend",
        ];
        if !KNOWN.contains(&tag.as_str()) {
            return Ok(ClientEnvelope::Unknown { tag, raw: value });
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Envelopes the server may send (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEnvelope {
    #[serde(rename = "hello")]
    Hello {
        version: u32,
        transport: String,
        session_id: String,
        audio_params: AudioParams,
    },

    #[serde(rename = "stt")]
    Stt { text: String },

    #[serde(rename = "llm")]
    Llm {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
    },

    #[serde(rename = "tts")]
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    #[serde(rename = "tts_fallback")]
    TtsFallback { text: String },

    #[serde(rename = "tts_disabled")]
    TtsDisabled,

    #[serde(rename = "mcp")]
    Mcp { payload: Value },

    #[serde(rename = "friend")]
    Friend { from: String, data: Value, timestamp: i64 },

    #[serde(rename = "friend_ack")]
    FriendAck { to: String, status: FriendAckStatus },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendAckStatus {
    Delivered,
    Unknown,
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips_through_json() {
        let text = r#"{
            "type":"hello","version":1,"transport":"websocket",
            "device_id":"dev-1","device_name":"kitchen",
            "features":{"mcp":true},
            "audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}
        }"#;
        let envelope = ClientEnvelope::parse(text).unwrap();
        match envelope {
            ClientEnvelope::Hello { version, features, audio_params, .. } => {
                assert_eq!(version, 1);
                assert!(features.mcp_enabled());
                assert!(audio_params.validate().is_ok());
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_a_parse_error() {
        let text = r#"{"type":"telemetry","payload":{}}"#;
        let envelope = ClientEnvelope::parse(text).unwrap();
        assert!(matches!(envelope, ClientEnvelope::Unknown { .. }));
    }

    #[test]
    fn missing_type_is_a_protocol_error() {
        let text = r#"{"foo":"bar"}"#;
        assert!(ClientEnvelope::parse(text).is_err());
    }

    #[test]
    fn bad_frame_duration_is_rejected() {
        let params = AudioParams { frame_duration: 37, ..AudioParams::default() };
        assert!(matches!(params.validate(), Err(ProtocolError::BadFrameDuration(37))));
    }

    #[test]
    fn server_hello_serializes_with_session_id() {
        let envelope = ServerEnvelope::Hello {
            version: 1,
            transport: "websocket".to_string(),
            session_id: "abc123".to_string(),
            audio_params: AudioParams::default(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"session_id\":\"abc123\""));
    }
}
