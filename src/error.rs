//! Per-subsystem error taxonomy.
//!
//! Each subsystem owns a narrow `thiserror` enum; `GatewayError` aggregates
//! them with `#[from]` conversions so call sites bubbling failures through
//! `?` never have to hand-wrap anything. Containment policy (which errors
//! tear the session down vs. get logged and swallowed) lives in the kernel,
//! not here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown envelope type: {0}")]
    UnknownType(String),

    #[error("handshake timed out waiting for hello")]
    HandshakeTimeout,

    #[error("missing required field on hello: {0}")]
    MissingField(&'static str),

    #[error("requested frame_duration {0}ms is not one of the negotiable values")]
    BadFrameDuration(u32),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("opus decode failed: {0}")]
    Decode(String),

    #[error("opus encode failed: {0}")]
    Encode(String),

    #[error("frame has an invalid length: {0} bytes")]
    InvalidLength(usize),
}

/// STT/LLM/TTS/Embedding upstream failures. `retryable` lets the kernel
/// decide whether a single failed utterance is a blip or the adapter is
/// down hard enough to warrant a louder warning.
#[derive(Debug, Error)]
#[error("{kind} adapter error: {message}")]
pub struct AdapterError {
    pub kind: AdapterKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Stt,
    Llm,
    Tts,
    Embedding,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterKind::Stt => "stt",
            AdapterKind::Llm => "llm",
            AdapterKind::Tts => "tts",
            AdapterKind::Embedding => "embedding",
        };
        f.write_str(s)
    }
}

impl AdapterError {
    pub fn transient(kind: AdapterKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retryable: true }
    }

    pub fn terminal(kind: AdapterKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retryable: false }
    }

    /// Client-visible error code used in the `error{code,message}` envelope.
    pub fn client_code(&self) -> String {
        format!("{}_failed", self.kind)
    }
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("jsonrpc error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("request {0} timed out")]
    Timeout(u64),

    #[error("response id {0} has no matching pending request")]
    UnknownId(u64),

    #[error("malformed mcp payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("audio buffer exceeded max utterance duration, truncated")]
    BufferOverflow,

    #[error("outbound queue exceeded depth {0}")]
    QueueOverflow(usize),

    #[error("session idle for more than {0}s")]
    IdleTimeout(u64),

    #[error("max concurrent session count ({0}) reached")]
    SessionLimitReached(usize),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer device '{0}' is not connected")]
    Unknown(String),

    #[error("peer device '{0}' dropped the message (queue full)")]
    Dropped(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read { path: String, #[source] source: std::io::Error },

    #[error("failed to parse config file '{path}': {source}")]
    Parse { path: String, #[source] source: toml::de::Error },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
