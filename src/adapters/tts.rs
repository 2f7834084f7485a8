//! Reference TTS adapter (§4.4): synthesizes a fixed sine tone, chopped
//! into 60ms Opus frames proportional to the input text's length, rather
//! than shipping a real voice model. From the kernel's perspective it
//! always yields 60ms Opus frames, same as a real backend would.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CancelToken, TtsAdapter, TtsEvent, TtsStream};
use crate::audio::codec::FrameCodec;
use crate::audio::constants::DEFAULT_FRAME_SIZE;

const TONE_HZ: f32 = 440.0;
const SAMPLE_RATE: f32 = 16_000.0;

pub struct StubTtsAdapter;

impl Default for StubTtsAdapter {
    fn default() -> Self {
        Self
    }
}

fn frame_count_for(text: &str) -> usize {
    // One frame per ~3 characters, at least one frame for any non-empty text.
    (text.chars().count() / 3).max(1)
}

#[async_trait]
impl TtsAdapter for StubTtsAdapter {
    async fn synthesize(&self, text: String, _voice: Option<String>, cancel: CancelToken) -> TtsStream {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            if text.trim().is_empty() {
                let _ = tx.send(Ok(TtsEvent::Done)).await;
                return;
            }

            let mut codec = match FrameCodec::new(DEFAULT_FRAME_SIZE) {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(crate::error::AdapterError::terminal(
                        crate::error::AdapterKind::Tts,
                        e.to_string(),
                    )))
                    .await;
                    return;
                }
            };

            let frames = frame_count_for(&text);
            for i in 0..frames {
                if cancel.is_cancelled() {
                    return;
                }
                let pcm: Vec<i16> = (0..DEFAULT_FRAME_SIZE)
                    .map(|n| {
                        let t = (i * DEFAULT_FRAME_SIZE + n) as f32 / SAMPLE_RATE;
                        (4000.0 * (t * TONE_HZ * std::f32::consts::TAU).sin()) as i16
                    })
                    .collect();
                match codec.encode(&pcm) {
                    Ok(packet) => {
                        if tx.send(Ok(TtsEvent::OpusFrame(packet))).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(crate::error::AdapterError::transient(
                                crate::error::AdapterKind::Tts,
                                e.to_string(),
                            )))
                            .await;
                        return;
                    }
                }
            }
            let _ = tx.send(Ok(TtsEvent::Done)).await;
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_text_yields_immediate_done() {
        let adapter = StubTtsAdapter::default();
        let mut stream = adapter.synthesize(String::new(), None, CancelToken::new()).await;
        assert!(matches!(stream.recv().await, Some(Ok(TtsEvent::Done))));
    }

    #[tokio::test]
    async fn non_empty_text_yields_at_least_one_frame_then_done() {
        let adapter = StubTtsAdapter::default();
        let mut stream = adapter.synthesize("hello there".to_string(), None, CancelToken::new()).await;
        let mut frames = 0;
        loop {
            match stream.recv().await {
                Some(Ok(TtsEvent::OpusFrame(packet))) => {
                    assert!(!packet.is_empty());
                    frames += 1;
                }
                Some(Ok(TtsEvent::Done)) => break,
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(frames >= 1);
    }

    #[tokio::test]
    async fn cancellation_stops_output_within_one_extra_frame() {
        let adapter = StubTtsAdapter::default();
        let cancel = CancelToken::new();
        let mut stream =
            adapter.synthesize("a much longer sentence to synthesize".to_string(), None, cancel.clone()).await;
        cancel.cancel();
        let mut extra = 0;
        while let Some(Ok(event)) = stream.recv().await {
            match event {
                TtsEvent::OpusFrame(_) => extra += 1,
                TtsEvent::Done => break,
            }
        }
        assert!(extra <= 1);
    }
}
