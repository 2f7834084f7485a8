//! Service adapters (§4.4): uniform, cancellable capability objects for
//! STT, LLM, TTS, embedding, and the merged MCP tool registry. The kernel
//! only ever holds `dyn` trait objects here — it never references a
//! concrete provider, per the dependency-injection redesign in §9.

pub mod embedding;
pub mod llm;
pub mod stt;
pub mod tts;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AdapterError;
use crate::mcp::ToolDescriptor;

/// One item of an STT stream.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Partial(String),
    Final(String),
}

/// One item of an LLM stream. A `ToolCall` pauses the underlying
/// generation task until the kernel dispatches it through MCP and posts
/// the result back on `result_tx` — there is no separate resume method,
/// the oneshot channel *is* the resume mechanism.
#[derive(Debug)]
pub enum LlmEvent {
    TextDelta(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
        result_tx: tokio::sync::oneshot::Sender<Result<serde_json::Value, AdapterError>>,
    },
    Done,
}

/// One item of a TTS stream.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    OpusFrame(Vec<u8>),
    Done,
}

pub type SttStream = mpsc::Receiver<Result<SttEvent, AdapterError>>;
pub type LlmStream = mpsc::Receiver<Result<LlmEvent, AdapterError>>;
pub type TtsStream = mpsc::Receiver<Result<TtsEvent, AdapterError>>;

/// Metadata handed to the STT adapter alongside raw PCM.
#[derive(Debug, Clone)]
pub struct RecognizeMeta {
    pub sample_rate: u32,
    pub truncated: bool,
}

/// A single turn of conversational history, for LLM context.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[async_trait]
pub trait SttAdapter: Send + Sync {
    /// Streams partial/final transcripts for one utterance. Adapters that
    /// don't support partials yield exactly one `Final`. The returned
    /// stream ends (the channel closes) promptly after cancellation.
    async fn recognize(
        &self,
        pcm: Vec<i16>,
        meta: RecognizeMeta,
        cancel: CancelToken,
    ) -> SttStream;
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn generate(
        &self,
        prompt: String,
        history: Vec<HistoryTurn>,
        tools: Vec<ToolDescriptor>,
        cancel: CancelToken,
    ) -> LlmStream;
}

#[async_trait]
pub trait TtsAdapter: Send + Sync {
    async fn synthesize(&self, text: String, voice: Option<String>, cancel: CancelToken) -> TtsStream;
}

#[async_trait]
pub trait EmbeddingAdapter: Send + Sync {
    /// Failure here is non-fatal to the pipeline (§4.4): the caller skips
    /// the memory-lookup step rather than aborting the utterance.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError>;
}

/// Cooperative cancellation flag shared between a `PipelineRun` and every
/// adapter stream it spawned (§5). Cloning is cheap; every clone observes
/// the same flip.
#[derive(Clone)]
pub struct CancelToken(Arc<tokio::sync::Notify>, Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(tokio::sync::Notify::new()), Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.1.store(true, std::sync::atomic::Ordering::SeqCst);
        self.0.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.1.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called; suitable for use in a
    /// `tokio::select!` alongside adapter I/O so cancellation interrupts
    /// promptly rather than waiting for the next poll.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The full set of capability objects a session is constructed with.
/// Immutable post-construction (§5) — nothing downstream mutates this,
/// it just gets cloned (cheap: everything inside is an `Arc`).
#[derive(Clone)]
pub struct Adapters {
    pub stt: Arc<dyn SttAdapter>,
    pub llm: Arc<dyn LlmAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
    pub embedding: Arc<dyn EmbeddingAdapter>,
}

impl Adapters {
    /// The in-process reference stack usable with no external network
    /// dependency (§4.4): a silence/echo STT stub, a canned-response LLM
    /// stub, a sine-tone TTS stub, a hash-based embedding stub. This is
    /// what makes the kernel runnable and testable standalone; production
    /// deployments construct `Adapters` from real network-backed clients
    /// implementing the same traits instead.
    pub fn stub() -> Self {
        Self {
            stt: Arc::new(stt::StubSttAdapter::default()),
            llm: Arc::new(llm::StubLlmAdapter::default()),
            tts: Arc::new(tts::StubTtsAdapter::default()),
            embedding: Arc::new(embedding::HashEmbeddingAdapter::default()),
        }
    }
}
