//! §8 scenario 3: barge-in during TTS playback cancels cleanly — no
//! orphan audio after `tts:stop`, and a new `stt` arrives for the
//! utterance that interrupted it.
//!
//! The stock TTS stub finishes too fast (no I/O, no delay) to reliably
//! observe mid-synthesis in a black-box test, so this scenario swaps in
//! a TTS adapter that emits one frame and then blocks until cancelled —
//! giving the test a stable window in which the session is provably
//! still `Speaking`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use vox_gateway::adapters::{
    embedding::HashEmbeddingAdapter, llm::StubLlmAdapter, stt::StubSttAdapter, Adapters, CancelToken, TtsAdapter,
    TtsEvent, TtsStream,
};

struct HangingTtsAdapter;

#[async_trait]
impl TtsAdapter for HangingTtsAdapter {
    async fn synthesize(&self, text: String, _voice: Option<String>, cancel: CancelToken) -> TtsStream {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            if text.trim().is_empty() {
                let _ = tx.send(Ok(TtsEvent::Done)).await;
                return;
            }
            if tx.send(Ok(TtsEvent::OpusFrame(vec![1, 2, 3, 4]))).await.is_err() {
                return;
            }
            // Never finishes on its own; only cancellation ends this stream,
            // simulating synthesis still in flight when barge-in arrives.
            cancel.cancelled().await;
        });
        rx
    }
}

fn adapters() -> Adapters {
    Adapters {
        stt: Arc::new(StubSttAdapter::default()),
        llm: Arc::new(StubLlmAdapter::default()),
        tts: Arc::new(HangingTtsAdapter),
        embedding: Arc::new(HashEmbeddingAdapter::default()),
    }
}

#[tokio::test]
async fn barge_in_stops_audio_cleanly_and_starts_a_new_utterance() {
    let addr = common::spawn_gateway(adapters()).await;
    let mut client = common::connect(addr, "dev-barge", "client").await;

    common::send_json(&mut client, &common::hello("dev-barge", false)).await;
    let hello_reply = common::recv_json(&mut client).await;
    assert_eq!(hello_reply["type"], "hello");

    // First utterance: loud frames (auto VAD speech-start), then silence
    // long enough to cross the hangover window and finalize it.
    for frame in common::loud_opus_frames(10) {
        client.send(Message::Binary(frame.into())).await.unwrap();
    }
    for frame in silence_frames(10) {
        client.send(Message::Binary(frame.into())).await.unwrap();
    }

    let stt = common::recv_json(&mut client).await;
    assert_eq!(stt["type"], "stt");

    let llm = common::recv_json(&mut client).await;
    assert_eq!(llm["type"], "llm");

    let tts_start = common::recv_json(&mut client).await;
    assert_eq!(tts_start["type"], "tts");
    assert_eq!(tts_start["state"], "start");

    let first_audio = common::recv_binary(&mut client, Duration::from_secs(2)).await;
    assert!(first_audio.is_some(), "expected at least one audio frame before barge-in");

    // Barge-in: a harmless explicit listen:start (no-op outside Ready)
    // followed by new loud audio, which is what actually flips the VAD
    // edge that triggers barge-in in Speaking state.
    common::send_json(&mut client, &json!({"type": "listen", "state": "start"})).await;
    for frame in common::loud_opus_frames(10) {
        client.send(Message::Binary(frame.into())).await.unwrap();
    }

    let tts_stop = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            let value = common::recv_json(&mut client).await;
            if value["type"] == "tts" && value["state"] == "stop" {
                return value;
            }
        }
    })
    .await
    .expect("tts:stop did not arrive within 500ms of barge-in");
    assert_eq!(tts_stop["state"], "stop");

    // Finalize the new utterance and confirm a fresh `stt` arrives with
    // no stray audio for the cancelled utterance in between.
    for frame in silence_frames(10) {
        client.send(Message::Binary(frame.into())).await.unwrap();
    }

    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), futures_util::StreamExt::next(&mut client))
            .await
            .expect("timed out waiting for the post-barge-in stt")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "stt" {
                    break;
                }
            }
            Message::Binary(_) => panic!("audio frame leaked after tts:stop for the cancelled utterance"),
            _ => {}
        }
    }
}

fn silence_frames(n: usize) -> Vec<Vec<u8>> {
    use vox_gateway::audio::constants::DEFAULT_FRAME_SIZE;
    use vox_gateway::audio::FrameCodec;

    let mut codec = FrameCodec::new(DEFAULT_FRAME_SIZE).expect("codec constructs");
    (0..n).map(|_| codec.encode(&vec![0i16; DEFAULT_FRAME_SIZE]).expect("encode succeeds")).collect()
}
