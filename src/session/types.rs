//! Session-scoped data types (§3).

use std::time::Instant;

use crate::adapters::{HistoryTurn, Role};
use crate::audio::AudioBuffer;
use crate::protocol::{AudioParams, Features};

/// The kernel's own state machine position (§4.7). Distinct from
/// `ListenState`: `ListenState` is the client-visible idle/listening/
/// processing/speaking label, `KernelState` additionally carries
/// `Greeting` and `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Greeting,
    Ready,
    Listening,
    Thinking,
    Speaking,
    Closing,
}

/// Client-visible listen-state label (§3). Transitions are total and
/// monotone within one utterance: idle -> listening -> processing ->
/// speaking -> idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl From<KernelState> for ListenState {
    fn from(state: KernelState) -> Self {
        match state {
            KernelState::Greeting | KernelState::Ready | KernelState::Closing => ListenState::Idle,
            KernelState::Listening => ListenState::Listening,
            KernelState::Thinking => ListenState::Processing,
            KernelState::Speaking => ListenState::Speaking,
        }
    }
}

/// An in-progress or just-finalized utterance (§3).
pub struct Utterance {
    pub utterance_id: u64,
    pub buffer: AudioBuffer,
    pub started_at: Instant,
}

impl Utterance {
    pub fn new(utterance_id: u64, capacity_samples: usize) -> Self {
        Self { utterance_id, buffer: AudioBuffer::new(capacity_samples), started_at: Instant::now() }
    }
}

/// Session-wide identity and negotiated parameters, set once at
/// handshake and read by every subtask thereafter.
#[derive(Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub device_id: String,
    pub client_id: String,
    pub features: Features,
    pub audio_params: AudioParams,
}

/// Rolling conversational context fed to the LLM adapter as `history`.
/// Capped so a very long-lived session doesn't grow this without bound;
/// this is explicitly not durable memory (§1 Non-goals) — it lives only
/// for the process lifetime of this session.
#[derive(Default)]
pub struct ConversationHistory {
    turns: Vec<HistoryTurn>,
    cap: usize,
}

impl ConversationHistory {
    pub fn new(cap: usize) -> Self {
        Self { turns: Vec::new(), cap }
    }

    pub fn push(&mut self, role: Role, text: String) {
        if text.is_empty() {
            return;
        }
        self.turns.push(HistoryTurn { role, text });
        if self.turns.len() > self.cap {
            self.turns.remove(0);
        }
    }

    pub fn snapshot(&self) -> Vec<HistoryTurn> {
        self.turns.clone()
    }
}

/// Splits accumulated LLM text into complete sentences plus a remaining
/// partial tail, per the §4.7 sentence-segmentation rule: break on
/// terminal punctuation, or on a whitespace run once the pending tail has
/// grown past `min_chars`.
pub struct SentenceSegmenter {
    pending: String,
    min_chars: usize,
}

const TERMINAL_PUNCTUATION: &[char] = &['.', '?', '!', '。', '？', '！', '；'];

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self { pending: String::new(), min_chars }
    }

    /// Feeds one delta; returns any sentences it completed, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.pending.push_str(delta);
        let mut completed = Vec::new();

        loop {
            let Some(boundary) = self.find_boundary() else { break };
            let sentence: String = self.pending.drain(..boundary).collect();
            let trimmed = sentence.trim();
            if !trimmed.is_empty() {
                completed.push(trimmed.to_string());
            }
        }
        completed
    }

    fn find_boundary(&self) -> Option<usize> {
        if let Some(idx) = self.pending.find(TERMINAL_PUNCTUATION) {
            let ch_len = self.pending[idx..].chars().next().map(char::len_utf8).unwrap_or(1);
            return Some(idx + ch_len);
        }
        if self.pending.chars().count() >= self.min_chars {
            if let Some(idx) = self.pending.find(char::is_whitespace) {
                return Some(idx + 1);
            }
        }
        None
    }

    /// Flushes any remaining partial text as a final sentence (called
    /// when the LLM stream reports `Done`).
    pub fn flush(&mut self) -> Option<String> {
        let trimmed = self.pending.trim().to_string();
        self.pending.clear();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_punctuation_splits_immediately() {
        let mut seg = SentenceSegmenter::new(40);
        let sentences = seg.push("Hello there. How are");
        assert_eq!(sentences, vec!["Hello there."]);
    }

    #[test]
    fn short_text_without_punctuation_stays_pending() {
        let mut seg = SentenceSegmenter::new(40);
        assert!(seg.push("Hello").is_empty());
        assert_eq!(seg.flush().as_deref(), Some("Hello"));
    }

    #[test]
    fn whitespace_run_after_min_chars_splits() {
        let mut seg = SentenceSegmenter::new(5);
        let sentences = seg.push("abcdef ghijk");
        assert_eq!(sentences, vec!["abcdef"]);
    }

    #[test]
    fn flush_after_full_sentence_returns_none() {
        let mut seg = SentenceSegmenter::new(40);
        seg.push("Done.");
        assert!(seg.flush().is_none());
    }

    #[test]
    fn chinese_terminal_punctuation_is_recognized() {
        let mut seg = SentenceSegmenter::new(40);
        let sentences = seg.push("你好。还有更多");
        assert_eq!(sentences, vec!["你好。"]);
    }
}
