//! Reference STT adapter (§4.4): a silence/echo stub so the kernel is
//! exercisable without a network-backed recognizer. It classifies PCM as
//! either silence (empty transcript) or voiced (a fixed placeholder
//! transcript), which is enough to drive the pipeline's control flow in
//! tests without shipping a real model.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CancelToken, RecognizeMeta, SttAdapter, SttEvent, SttStream};
use crate::error::AdapterError;

pub struct StubSttAdapter {
    /// Transcript returned for any utterance with non-trivial energy.
    echo_text: String,
}

impl Default for StubSttAdapter {
    fn default() -> Self {
        Self { echo_text: "你好".to_string() }
    }
}

fn has_energy(pcm: &[i16]) -> bool {
    pcm.iter().any(|&s| s.unsigned_abs() as u32 > 200)
}

#[async_trait]
impl SttAdapter for StubSttAdapter {
    async fn recognize(&self, pcm: Vec<i16>, meta: RecognizeMeta, cancel: CancelToken) -> SttStream {
        let (tx, rx) = mpsc::channel(4);
        let echo_text = self.echo_text.clone();

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            let text = if pcm.is_empty() || !has_energy(&pcm) {
                String::new()
            } else if meta.truncated {
                format!("{echo_text}…")
            } else {
                echo_text
            };
            let _ = tx.send(Ok(SttEvent::Final(text))).await;
        });

        rx
    }
}
