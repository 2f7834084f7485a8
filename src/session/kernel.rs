//! `SessionKernel`: the per-connection state machine (§4.7). Owns
//! handshake, listen-state, utterance assembly, pipeline orchestration,
//! cancellation, and the MCP sub-session. Runs as a single task driven by
//! one `tokio::select!` loop; the socket itself belongs to `ConnectionMux`,
//! which feeds this task [`IngestEvent`]s and drains the outbound queue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapters::{Adapters, Role};
use crate::audio::{FrameCodec, RmsThresholdVad, VadEdge, VoiceActivityDetector};
use crate::config::GatewayConfig;
use crate::error::McpError;
use crate::mcp::{parse_tools_page, JsonRpcRequest, McpSubsession};
use crate::peer::{OfferOutcome, PeerHandle, PeerRegistry};
use crate::protocol::{AudioParams, ClientEnvelope, Features, FriendAckStatus, ListenMode, ServerEnvelope, TtsState};

use super::outbound::OutboundSender;
use super::pipeline::{self, McpCallRequest, PipelineEvent, PipelineHandle, PipelineParams};
use super::types::{ConversationHistory, KernelState, SessionIdentity, Utterance};

/// Fed into the kernel by the ingest side of `ConnectionMux`. A closed
/// channel (no more events, `recv` returns `None`) is how the kernel learns
/// the socket is gone.
#[derive(Debug)]
pub enum IngestEvent {
    Text(String),
    Binary(Vec<u8>),
}

/// Results of requests the kernel issued to itself via forwarded oneshots
/// (MCP initialize/tools-list pagination). Kept as its own channel rather
/// than awaiting the oneshots inline so the main loop never blocks on a
/// device that's slow to answer.
enum KernelInternal {
    McpInitResult(Result<Value, McpError>),
    McpToolsPage(Result<Value, McpError>),
}

pub struct SessionKernel {
    identity: SessionIdentity,
    config: Arc<GatewayConfig>,
    adapters: Adapters,
    peer_registry: Arc<PeerRegistry>,
    outbound: OutboundSender,
    codec: FrameCodec,
    vad: RmsThresholdVad,
    listen_mode: ListenMode,
    state: KernelState,
    utterance: Option<Utterance>,
    next_utterance_id: u64,
    next_pipeline_id: u64,
    pipeline: Option<PipelineHandle>,
    mcp: Option<McpSubsession>,
    mcp_enabled: bool,
    mcp_calls_tx: mpsc::Sender<McpCallRequest>,
    mcp_calls_rx: mpsc::Receiver<McpCallRequest>,
    internal_tx: mpsc::Sender<KernelInternal>,
    internal_rx: mpsc::Receiver<KernelInternal>,
    history: ConversationHistory,
}

const SENTENCE_MIN_CHARS: usize = 40;
const HISTORY_TURNS_CAP: usize = 16;
const MCP_SWEEP_INTERVAL_SECS: u64 = 5;

impl SessionKernel {
    pub fn new(
        device_id: String,
        client_id: String,
        config: Arc<GatewayConfig>,
        adapters: Adapters,
        peer_registry: Arc<PeerRegistry>,
        outbound: OutboundSender,
    ) -> Self {
        let (mcp_calls_tx, mcp_calls_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::channel(8);

        Self {
            identity: SessionIdentity {
                session_id: uuid::Uuid::new_v4().to_string(),
                device_id,
                client_id,
                features: Features::default(),
                audio_params: AudioParams::default(),
            },
            config,
            adapters,
            peer_registry,
            outbound,
            // Placeholder codec at the default frame size; rebuilt in
            // `complete_handshake` once the negotiated frame duration is
            // known.
            codec: FrameCodec::new(crate::audio::constants::DEFAULT_FRAME_SIZE)
                .expect("default opus profile always constructs"),
            vad: RmsThresholdVad::new(&crate::config::VadSettings::default(), crate::audio::constants::DEFAULT_FRAME_DURATION_MS),
            listen_mode: ListenMode::Auto,
            state: KernelState::Greeting,
            utterance: None,
            next_utterance_id: 0,
            next_pipeline_id: 0,
            pipeline: None,
            mcp: None,
            mcp_enabled: false,
            mcp_calls_tx,
            mcp_calls_rx,
            internal_tx,
            internal_rx,
            history: ConversationHistory::new(HISTORY_TURNS_CAP),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    /// Runs the kernel to completion: handshake, then the steady-state
    /// event loop, then cleanup. Consumes `self` and the ingest channel —
    /// there is exactly one of each per connection.
    pub async fn run(mut self, mut ingest: mpsc::Receiver<IngestEvent>) {
        if !self.perform_handshake(&mut ingest).await {
            self.shutdown().await;
            return;
        }

        let mut mcp_sweep = tokio::time::interval(Duration::from_secs(MCP_SWEEP_INTERVAL_SECS));
        mcp_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = ingest.recv() => {
                    match maybe_event {
                        Some(IngestEvent::Text(text)) => self.handle_text(text).await,
                        Some(IngestEvent::Binary(bytes)) => self.handle_binary(bytes).await,
                        None => break,
                    }
                }

                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }

                Some(call) = self.mcp_calls_rx.recv() => {
                    self.handle_mcp_call(call).await;
                }

                evt = self.pipeline.as_mut().unwrap().events.recv(), if self.pipeline.is_some() => {
                    match evt {
                        Some(event) => {
                            let done = self.handle_pipeline_event(event).await;
                            if done {
                                self.pipeline = None;
                            }
                        }
                        None => self.pipeline = None,
                    }
                }

                _ = mcp_sweep.tick(), if self.mcp.is_some() => {
                    self.mcp.as_mut().unwrap().sweep_timeouts();
                }
            }
        }

        self.shutdown().await;
    }

    /// Waits for a valid `hello` within the idle-timeout window, reusing
    /// it as the handshake deadline (§9: no separate handshake timer is
    /// warranted — an unauthenticated connection that never says hello is
    /// just a slow-to-start idle one). Returns `false` if the handshake
    /// never completes and the caller should tear the connection down.
    async fn perform_handshake(&mut self, ingest: &mut mpsc::Receiver<IngestEvent>) -> bool {
        let deadline = Duration::from_secs(self.config.server.idle_timeout_secs);

        let hello = tokio::time::timeout(deadline, async {
            loop {
                match ingest.recv().await {
                    Some(IngestEvent::Text(text)) => match ClientEnvelope::parse(&text) {
                        Ok(ClientEnvelope::Hello { version, transport, device_id, device_name: _, features, audio_params }) => {
                            return Some((version, transport, device_id, features, audio_params));
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "pre-handshake envelope ignored");
                            continue;
                        }
                    },
                    Some(IngestEvent::Binary(_)) => continue,
                    None => return None,
                }
            }
        })
        .await;

        let Ok(Some((version, transport, device_id_opt, features, audio_params))) = hello else {
            warn!("handshake failed or timed out");
            self.outbound
                .control(ServerEnvelope::Error { code: "handshake_timeout".to_string(), message: "no valid hello received".to_string() })
                .await;
            return false;
        };

        if audio_params.validate().is_err() {
            warn!(?audio_params, "hello proposed an unsupported audio profile");
            self.outbound
                .control(ServerEnvelope::Error { code: "bad_audio_params".to_string(), message: "unsupported audio_params".to_string() })
                .await;
            return false;
        }

        if device_id_opt.is_none() {
            warn!("hello missing device_id");
            self.outbound
                .control(ServerEnvelope::Error { code: "missing_device_id".to_string(), message: "device_id is required".to_string() })
                .await;
            return false;
        }

        self.identity.audio_params = audio_params.clone();
        self.identity.features = features;
        if let Some(device_id) = device_id_opt {
            self.identity.device_id = device_id;
        }

        let frame_size = crate::audio::constants::frame_size_for(audio_params.frame_duration);
        match FrameCodec::new(frame_size) {
            Ok(codec) => self.codec = codec,
            Err(e) => {
                warn!(error = %e, "failed to construct opus codec for negotiated profile");
                return false;
            }
        }
        self.vad = RmsThresholdVad::new(&self.config.vad, audio_params.frame_duration);

        self.state = KernelState::Ready;
        info!(session_id = %self.identity.session_id, device_id = %self.identity.device_id, "session ready");

        self.peer_registry.publish(&self.identity.device_id, PeerHandle::new(self.writer_handle()));

        self.outbound
            .control(ServerEnvelope::Hello {
                version,
                transport,
                session_id: self.identity.session_id.clone(),
                audio_params,
            })
            .await;

        if self.identity.features.mcp_enabled() {
            self.mcp_enabled = true;
            let mut sub = McpSubsession::new(Duration::from_secs(self.config.mcp.request_timeout_secs));
            let (request, rx) = sub.build_initialize("vox-gateway", env!("CARGO_PKG_VERSION"));
            self.mcp = Some(sub);
            self.send_mcp_request(request).await;
            self.spawn_mcp_forwarder(rx, KernelInternal::McpInitResult);
        }

        true
    }

    /// A peer-registry handle needs its own `mpsc::Sender`; the kernel
    /// doesn't keep one of those lying around (it pushes through
    /// `OutboundSender`/`OutboundQueue` instead), so friend delivery is
    /// wired through the same outbound queue as everything else: the
    /// registry holds a tiny adapter channel whose receiver forwards into
    /// this session's `OutboundQueue`.
    fn writer_handle(&self) -> mpsc::Sender<ServerEnvelope> {
        let (tx, mut rx) = mpsc::channel::<ServerEnvelope>(32);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                outbound.control(envelope).await;
            }
        });
        tx
    }

    async fn handle_text(&mut self, text: String) {
        let envelope = match ClientEnvelope::parse(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed envelope");
                self.outbound.control(ServerEnvelope::Error { code: "malformed".to_string(), message: e.to_string() }).await;
                return;
            }
        };

        match envelope {
            ClientEnvelope::Hello { .. } => {
                debug!("duplicate hello after handshake, ignored");
            }
            ClientEnvelope::Listen { state, mode } => self.handle_listen(state, mode).await,
            ClientEnvelope::Abort { reason } => self.handle_abort(reason).await,
            ClientEnvelope::Chat { text, .. } => self.handle_chat(text).await,
            ClientEnvelope::WakeWordDetected { .. } => self.handle_wake_word().await,
            ClientEnvelope::Iot { .. } => debug!("iot envelope received, no-op passthrough"),
            ClientEnvelope::Mcp { payload } => self.handle_mcp_inbound(payload),
            ClientEnvelope::Friend { clientid, data } => self.handle_friend(clientid, data).await,
            ClientEnvelope::Unknown { tag, .. } => warn!(tag, "dropping envelope of unknown type"),
        }
    }

    async fn handle_listen(&mut self, state: crate::protocol::ListenState, mode: Option<ListenMode>) {
        use crate::protocol::ListenState as WireListenState;

        if let Some(mode) = mode {
            self.listen_mode = mode;
        }

        match state {
            WireListenState::Start => {
                if self.state == KernelState::Ready {
                    self.begin_utterance().await;
                }
            }
            WireListenState::Stop => {
                if self.state == KernelState::Listening {
                    self.finalize_utterance(false).await;
                }
            }
            WireListenState::Detect => {
                debug!("listen:detect acknowledged, no state change");
            }
        }
    }

    async fn handle_wake_word(&mut self) {
        if self.state == KernelState::Ready {
            self.begin_utterance().await;
        } else {
            debug!("wake word ignored outside of Ready");
        }
    }

    async fn handle_abort(&mut self, reason: Option<String>) {
        if matches!(self.state, KernelState::Thinking | KernelState::Speaking) {
            debug!(?reason, "aborting active pipeline");
            if let Some(pipeline) = self.pipeline.take() {
                pipeline.cancel();
            }
            self.state = KernelState::Ready;
            self.outbound.control(ServerEnvelope::Tts { state: TtsState::Stop, text: None }).await;
        }
    }

    async fn handle_chat(&mut self, text: String) {
        if matches!(self.state, KernelState::Thinking | KernelState::Speaking) {
            if let Some(pipeline) = self.pipeline.take() {
                pipeline.cancel();
            }
        }
        self.state = KernelState::Thinking;
        self.spawn_pipeline(Vec::new(), false, Some(text));
    }

    fn handle_mcp_inbound(&mut self, payload: Value) {
        match self.mcp.as_mut() {
            Some(sub) => sub.handle_inbound(payload),
            None => warn!("mcp payload received but mcp was not negotiated for this session"),
        }
    }

    async fn handle_friend(&mut self, clientid: String, data: Value) {
        let envelope = ServerEnvelope::Friend { from: self.identity.device_id.clone(), data, timestamp: chrono::Utc::now().timestamp() };
        let outcome = self.peer_registry.deliver(&clientid, envelope);
        let status = match outcome {
            OfferOutcome::Accepted => FriendAckStatus::Delivered,
            OfferOutcome::Full => FriendAckStatus::Dropped,
            OfferOutcome::Closed => FriendAckStatus::Unknown,
        };
        self.outbound.control(ServerEnvelope::FriendAck { to: clientid, status }).await;
    }

    async fn handle_binary(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            if self.state == KernelState::Listening {
                self.finalize_utterance(false).await;
            }
            return;
        }

        let pcm = match self.codec.decode(&bytes) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(error = %e, "dropping unreadable audio frame");
                return;
            }
        };

        let edge = if self.listen_mode == ListenMode::Auto { self.vad.tick(&pcm) } else { None };

        match self.state {
            KernelState::Listening => {
                let overflowed = self.utterance.as_mut().map(|u| u.buffer.append(&pcm)).unwrap_or(false);
                if overflowed {
                    self.finalize_utterance(true).await;
                } else if edge == Some(VadEdge::SpeechEnd) {
                    self.finalize_utterance(false).await;
                }
            }
            KernelState::Ready => {
                if edge == Some(VadEdge::SpeechStart) {
                    self.begin_utterance().await;
                    if let Some(utterance) = self.utterance.as_mut() {
                        utterance.buffer.append(&pcm);
                    }
                }
            }
            KernelState::Thinking | KernelState::Speaking => {
                if edge == Some(VadEdge::SpeechStart) {
                    self.barge_in().await;
                    if let Some(utterance) = self.utterance.as_mut() {
                        utterance.buffer.append(&pcm);
                    }
                }
            }
            KernelState::Greeting | KernelState::Closing => {}
        }
    }

    async fn begin_utterance(&mut self) {
        self.vad.reset();
        self.next_utterance_id += 1;
        let capacity = self.config.audio.max_utterance_secs as usize * crate::audio::constants::SAMPLE_RATE as usize;
        self.utterance = Some(Utterance::new(self.next_utterance_id, capacity));
        self.state = KernelState::Listening;
        debug!(utterance_id = self.next_utterance_id, "utterance started");
    }

    async fn barge_in(&mut self) {
        debug!("barge-in: cancelling active pipeline");
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.cancel();
        }
        if self.state == KernelState::Speaking {
            self.outbound.control(ServerEnvelope::Tts { state: TtsState::Stop, text: None }).await;
        }
        self.begin_utterance().await;
    }

    async fn finalize_utterance(&mut self, forced: bool) {
        let Some(utterance) = self.utterance.take() else { return };
        let finalized = utterance.buffer.finalize();
        if finalized.pcm.is_empty() {
            debug!(utterance_id = utterance.utterance_id, "empty utterance discarded, no stt invoked");
            self.state = KernelState::Ready;
            return;
        }
        self.state = KernelState::Thinking;
        debug!(truncated = finalized.truncated || forced, samples = finalized.pcm.len(), "utterance finalized");
        self.spawn_pipeline(finalized.pcm, finalized.truncated || forced, None);
    }

    fn spawn_pipeline(&mut self, pcm: Vec<i16>, truncated: bool, prefilled_text: Option<String>) {
        self.next_pipeline_id += 1;
        let tools = self.mcp.as_ref().map(|m| m.tools.clone()).unwrap_or_default();
        let mcp_calls = if self.mcp_enabled { Some(self.mcp_calls_tx.clone()) } else { None };

        let params = PipelineParams {
            pipeline_id: self.next_pipeline_id,
            pcm,
            truncated,
            sample_rate: self.identity.audio_params.sample_rate,
            history: self.history.snapshot(),
            tools,
            adapters: self.adapters.clone(),
            outbound: self.outbound.clone(),
            mcp_calls,
            sentence_min_chars: SENTENCE_MIN_CHARS,
            tts_enabled: self.identity.features.tts_enabled(),
            prefilled_text,
        };
        self.pipeline = Some(pipeline::spawn(params));
    }

    /// Returns `true` once the pipeline run has fully concluded (normally
    /// or with an error) so the caller can drop its `PipelineHandle`.
    async fn handle_pipeline_event(&mut self, event: PipelineEvent) -> bool {
        match event {
            PipelineEvent::SttFinal(text) => {
                if !text.trim().is_empty() {
                    self.history.push(Role::User, text);
                }
                false
            }
            PipelineEvent::SpeakingStarted => {
                self.state = KernelState::Speaking;
                false
            }
            PipelineEvent::Failed(err) => {
                warn!(error = %err, "pipeline run failed");
                self.state = KernelState::Ready;
                true
            }
            PipelineEvent::Finished => {
                self.state = KernelState::Ready;
                true
            }
        }
    }

    async fn handle_mcp_call(&mut self, call: McpCallRequest) {
        let Some(sub) = self.mcp.as_mut() else {
            let _ = call.respond_to.send(Err(McpError::Malformed("mcp not negotiated".to_string())));
            return;
        };
        let (request, rx) = sub.build_tools_call(&call.name, call.arguments);
        self.send_mcp_request(request).await;

        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                let _ = call.respond_to.send(result);
            }
        });
    }

    async fn handle_internal(&mut self, event: KernelInternal) {
        match event {
            KernelInternal::McpInitResult(Ok(_)) => {
                debug!("mcp initialize complete, requesting tools/list");
                if let Some(sub) = self.mcp.as_mut() {
                    let (request, rx) = sub.build_tools_list("");
                    self.send_mcp_request(request).await;
                    self.spawn_mcp_forwarder(rx, KernelInternal::McpToolsPage);
                }
            }
            KernelInternal::McpInitResult(Err(e)) => {
                warn!(error = %e, "mcp initialize failed, tool use disabled for this session");
            }
            KernelInternal::McpToolsPage(Ok(value)) => match parse_tools_page(value) {
                Ok(page) => {
                    let next_cursor = page.next_cursor.clone();
                    if let Some(sub) = self.mcp.as_mut() {
                        sub.merge_tools(&page);
                    }
                    if let Some(cursor) = next_cursor {
                        if let Some(sub) = self.mcp.as_mut() {
                            let (request, rx) = sub.build_tools_list(&cursor);
                            self.send_mcp_request(request).await;
                            self.spawn_mcp_forwarder(rx, KernelInternal::McpToolsPage);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "malformed tools/list result"),
            },
            KernelInternal::McpToolsPage(Err(e)) => {
                warn!(error = %e, "tools/list page request failed");
            }
        }
    }

    async fn send_mcp_request(&self, request: JsonRpcRequest) {
        let payload = serde_json::to_value(&request).expect("JsonRpcRequest always serializes");
        self.outbound.control(ServerEnvelope::Mcp { payload }).await;
    }

    fn spawn_mcp_forwarder(
        &self,
        rx: oneshot::Receiver<Result<Value, McpError>>,
        wrap: fn(Result<Value, McpError>) -> KernelInternal,
    ) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                let _ = tx.send(wrap(result)).await;
            }
        });
    }

    async fn shutdown(mut self) {
        self.state = KernelState::Closing;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.cancel();
        }
        if let Some(sub) = self.mcp.as_mut() {
            sub.cancel_all();
        }
        self.peer_registry.revoke(&self.identity.device_id);
        info!(session_id = %self.identity.session_id, "session closed");
    }
}
