//! `PipelineRun`: one STT -> LLM -> TTS orchestration for a single
//! utterance (§4.7, "Thinking"/"Speaking" states). Runs as its own task so
//! the kernel's main loop never blocks on adapter I/O; progress is
//! reported back over an event channel the kernel selects on alongside
//! inbound frames.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::adapters::{Adapters, CancelToken, HistoryTurn, LlmEvent, RecognizeMeta, SttEvent, TtsEvent};
use crate::error::{AdapterError, McpError};
use crate::mcp::ToolDescriptor;
use crate::protocol::{ServerEnvelope, TtsState};

use super::outbound::OutboundSender;
use super::types::SentenceSegmenter;

/// A tool invocation the pipeline can't perform itself — it has no
/// transport, only the kernel owns the `McpSubsession` and the socket.
/// The kernel receives this, issues the JSON-RPC request, and resolves
/// `respond_to` once the device answers (or the request times out).
pub struct McpCallRequest {
    pub name: String,
    pub arguments: Value,
    pub respond_to: oneshot::Sender<Result<Value, McpError>>,
}

/// Progress reported from the pipeline task back to the kernel loop. The
/// kernel uses these to drive its own `KernelState` transitions; the
/// pipeline task never touches kernel state directly.
#[derive(Debug)]
pub enum PipelineEvent {
    SttFinal(String),
    SpeakingStarted,
    Failed(AdapterError),
    Finished,
}

pub struct PipelineHandle {
    pub pipeline_id: u64,
    pub cancel: CancelToken,
    pub events: mpsc::Receiver<PipelineEvent>,
    pub task: tokio::task::JoinHandle<()>,
}

impl PipelineHandle {
    /// Flips the cancel token. The task observes it cooperatively at
    /// every suspension point (§5) rather than being forcibly aborted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct PipelineParams {
    pub pipeline_id: u64,
    pub pcm: Vec<i16>,
    pub truncated: bool,
    pub sample_rate: u32,
    pub history: Vec<HistoryTurn>,
    pub tools: Vec<ToolDescriptor>,
    pub adapters: Adapters,
    pub outbound: OutboundSender,
    pub mcp_calls: Option<mpsc::Sender<McpCallRequest>>,
    pub sentence_min_chars: usize,
    pub tts_enabled: bool,
    /// Set for `chat` input: the text is already final, so the STT stage
    /// is skipped and this is emitted as the `stt` transcript directly.
    pub prefilled_text: Option<String>,
}

/// Spawns the pipeline task and returns a handle the kernel holds onto
/// for the duration of the utterance.
pub fn spawn(params: PipelineParams) -> PipelineHandle {
    let cancel = CancelToken::new();
    let (events_tx, events_rx) = mpsc::channel(8);
    let task_cancel = cancel.clone();
    let pipeline_id = params.pipeline_id;

    let task = tokio::spawn(async move {
        run(params, task_cancel, events_tx).await;
    });

    PipelineHandle { pipeline_id, cancel, events: events_rx, task }
}

async fn run(params: PipelineParams, cancel: CancelToken, events: mpsc::Sender<PipelineEvent>) {
    let PipelineParams {
        pcm,
        truncated,
        sample_rate,
        history,
        tools,
        adapters,
        outbound,
        mcp_calls,
        sentence_min_chars,
        tts_enabled,
        prefilled_text,
    } = params;

    let text = match prefilled_text {
        Some(text) => text,
        None => match run_stt(&adapters, pcm, truncated, sample_rate, &cancel).await {
            Ok(text) => text,
            Err(err) => {
                emit_error(&outbound, &err).await;
                let _ = events.send(PipelineEvent::Failed(err)).await;
                return;
            }
        },
    };

    if cancel.is_cancelled() {
        let _ = events.send(PipelineEvent::Finished).await;
        return;
    }

    outbound.control(ServerEnvelope::Stt { text: text.clone() }).await;
    let _ = events.send(PipelineEvent::SttFinal(text.clone())).await;

    if text.trim().is_empty() {
        let _ = events.send(PipelineEvent::Finished).await;
        return;
    }

    let run_result = run_llm_tts(
        &adapters,
        text,
        history,
        tools,
        &cancel,
        &outbound,
        mcp_calls,
        sentence_min_chars,
        tts_enabled,
        &events,
    )
    .await;

    match run_result {
        Ok(()) => {
            let _ = events.send(PipelineEvent::Finished).await;
        }
        Err(err) => {
            emit_error(&outbound, &err).await;
            let _ = events.send(PipelineEvent::Failed(err)).await;
        }
    }
}

async fn emit_error(outbound: &OutboundSender, err: &AdapterError) {
    outbound
        .control(ServerEnvelope::Error { code: err.client_code(), message: err.message.clone() })
        .await;
}

async fn run_stt(
    adapters: &Adapters,
    pcm: Vec<i16>,
    truncated: bool,
    sample_rate: u32,
    cancel: &CancelToken,
) -> Result<String, AdapterError> {
    let meta = RecognizeMeta { sample_rate, truncated };
    let mut stream = adapters.stt.recognize(pcm, meta, cancel.clone()).await;

    loop {
        if cancel.is_cancelled() {
            return Ok(String::new());
        }
        match stream.recv().await {
            Some(Ok(SttEvent::Partial(_))) => continue,
            Some(Ok(SttEvent::Final(text))) => return Ok(text),
            Some(Err(err)) => return Err(err),
            None => return Ok(String::new()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_llm_tts(
    adapters: &Adapters,
    prompt: String,
    history: Vec<HistoryTurn>,
    tools: Vec<ToolDescriptor>,
    cancel: &CancelToken,
    outbound: &OutboundSender,
    mcp_calls: Option<mpsc::Sender<McpCallRequest>>,
    sentence_min_chars: usize,
    tts_enabled: bool,
    events: &mpsc::Sender<PipelineEvent>,
) -> Result<(), AdapterError> {
    let mut stream = adapters.llm.generate(prompt, history, tools, cancel.clone()).await;
    let mut segmenter = SentenceSegmenter::new(sentence_min_chars);
    let mut speaking_started = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match stream.recv().await {
            Some(Ok(LlmEvent::TextDelta(delta))) => {
                for sentence in segmenter.push(&delta) {
                    speak_sentence(adapters, &sentence, cancel, outbound, tts_enabled, &mut speaking_started, events).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
            Some(Ok(LlmEvent::ToolCall { name, arguments, result_tx })) => {
                dispatch_tool_call(name, arguments, result_tx, &mcp_calls).await;
            }
            Some(Ok(LlmEvent::Done)) => {
                if let Some(sentence) = segmenter.flush() {
                    speak_sentence(adapters, &sentence, cancel, outbound, tts_enabled, &mut speaking_started, events).await;
                }
                break;
            }
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }

    if speaking_started {
        outbound.control(ServerEnvelope::Tts { state: TtsState::Stop, text: None }).await;
    }
    Ok(())
}

async fn dispatch_tool_call(
    name: String,
    arguments: Value,
    result_tx: oneshot::Sender<Result<Value, AdapterError>>,
    mcp_calls: &Option<mpsc::Sender<McpCallRequest>>,
) {
    let Some(sender) = mcp_calls else {
        let _ = result_tx.send(Err(AdapterError::terminal(
            crate::error::AdapterKind::Llm,
            format!("tool '{name}' requested but this session has no mcp sub-session"),
        )));
        return;
    };

    let (forward_tx, forward_rx) = oneshot::channel();
    if sender.send(McpCallRequest { name: name.clone(), arguments, respond_to: forward_tx }).await.is_err() {
        let _ = result_tx.send(Err(AdapterError::terminal(crate::error::AdapterKind::Llm, "session closed")));
        return;
    }

    match forward_rx.await {
        Ok(Ok(value)) => {
            let _ = result_tx.send(Ok(value));
        }
        Ok(Err(mcp_err)) => {
            let _ = result_tx.send(Err(AdapterError::transient(crate::error::AdapterKind::Llm, mcp_err.to_string())));
        }
        Err(_) => {
            let _ = result_tx.send(Err(AdapterError::transient(crate::error::AdapterKind::Llm, "mcp call dropped")));
        }
    }
}

/// Speaks one sentence. TTS failures degrade to a `tts_fallback` envelope
/// for this sentence rather than failing the whole utterance (§9) — only
/// STT/LLM failures are treated as fatal to the pipeline run.
async fn speak_sentence(
    adapters: &Adapters,
    sentence: &str,
    cancel: &CancelToken,
    outbound: &OutboundSender,
    tts_enabled: bool,
    speaking_started: &mut bool,
    events: &mpsc::Sender<PipelineEvent>,
) {
    outbound.control(ServerEnvelope::Llm { text: sentence.to_string(), emotion: None }).await;

    if !tts_enabled {
        outbound.control(ServerEnvelope::TtsFallback { text: sentence.to_string() }).await;
        return;
    }

    let mut stream = adapters.tts.synthesize(sentence.to_string(), None, cancel.clone()).await;
    let mut sentence_announced = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match stream.recv().await {
            Some(Ok(TtsEvent::OpusFrame(frame))) => {
                if !*speaking_started {
                    outbound.control(ServerEnvelope::Tts { state: TtsState::Start, text: None }).await;
                    *speaking_started = true;
                    let _ = events.send(PipelineEvent::SpeakingStarted).await;
                }
                if !sentence_announced {
                    outbound
                        .control(ServerEnvelope::Tts { state: TtsState::SentenceStart, text: Some(sentence.to_string()) })
                        .await;
                    sentence_announced = true;
                }
                let congested = outbound.audio(frame).await;
                if congested {
                    warn!("outbound queue congested, cancelling pipeline");
                    cancel.cancel();
                    break;
                }
            }
            Some(Ok(TtsEvent::Done)) => break,
            Some(Err(err)) => {
                warn!(error = %err, "tts synthesis failed, falling back to text");
                outbound.control(ServerEnvelope::TtsFallback { text: sentence.to_string() }).await;
                break;
            }
            None => break,
        }
    }
}
