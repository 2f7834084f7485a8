//! The per-connection session: state machine, outbound ordering, and
//! pipeline orchestration (§3, §4.7).

pub mod kernel;
pub mod outbound;
pub mod pipeline;
pub mod types;

pub use kernel::{IngestEvent, SessionKernel};
pub use outbound::{OutboundItem, OutboundQueue, OutboundSender};
pub use pipeline::{McpCallRequest, PipelineEvent, PipelineHandle};
pub use types::{ConversationHistory, KernelState, ListenState, SentenceSegmenter, SessionIdentity, Utterance};
