//! §8 scenario 6: an STT failure surfaces as `error{code:"stt_failed"}`
//! with no `llm`/`tts` envelopes following it, and the session returns to
//! `Ready` (provable by a second utterance completing normally) rather
//! than the socket being torn down.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use vox_gateway::adapters::{
    embedding::HashEmbeddingAdapter, llm::StubLlmAdapter, tts::StubTtsAdapter, Adapters, CancelToken, RecognizeMeta,
    SttAdapter, SttStream,
};
use vox_gateway::error::{AdapterError, AdapterKind};

struct FailingSttAdapter;

#[async_trait]
impl SttAdapter for FailingSttAdapter {
    async fn recognize(&self, _pcm: Vec<i16>, _meta: RecognizeMeta, _cancel: CancelToken) -> SttStream {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Err(AdapterError::terminal(AdapterKind::Stt, "recognizer unavailable"))).await;
        rx
    }
}

fn adapters() -> Adapters {
    Adapters {
        stt: Arc::new(FailingSttAdapter),
        llm: Arc::new(StubLlmAdapter::default()),
        tts: Arc::new(StubTtsAdapter::default()),
        embedding: Arc::new(HashEmbeddingAdapter::default()),
    }
}

#[tokio::test]
async fn stt_failure_surfaces_as_error_and_session_stays_open() {
    let addr = common::spawn_gateway(adapters()).await;
    let mut client = common::connect(addr, "dev-fail", "client").await;

    common::send_json(&mut client, &common::hello("dev-fail", false)).await;
    let hello_reply = common::recv_json(&mut client).await;
    assert_eq!(hello_reply["type"], "hello");

    common::send_json(&mut client, &json!({"type": "listen", "state": "start", "mode": "manual"})).await;
    for frame in common::loud_opus_frames(5) {
        client.send(Message::Binary(frame.into())).await.unwrap();
    }
    common::send_json(&mut client, &json!({"type": "listen", "state": "stop"})).await;

    let error = tokio::time::timeout(Duration::from_secs(1), common::recv_json(&mut client))
        .await
        .expect("no error envelope arrived within 1s");
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "stt_failed");

    // Nothing else should follow for this utterance: no stray llm/tts.
    let extra = tokio::time::timeout(Duration::from_millis(300), common::recv_json(&mut client)).await;
    assert!(extra.is_err(), "unexpected envelope after stt_failed: the pipeline should have stopped there");

    // The session is still usable: the kernel accepts and processes a
    // second utterance at all, proving it returned to `Ready` rather than
    // wedging or dropping the socket after the failure.
    common::send_json(&mut client, &json!({"type": "listen", "state": "start", "mode": "manual"})).await;
    for frame in common::loud_opus_frames(5) {
        client.send(Message::Binary(frame.into())).await.unwrap();
    }
    common::send_json(&mut client, &json!({"type": "listen", "state": "stop"})).await;

    let second_error = tokio::time::timeout(Duration::from_secs(1), common::recv_json(&mut client))
        .await
        .expect("session did not accept a second utterance after the first failure");
    assert_eq!(second_error["type"], "error");
    assert_eq!(second_error["code"], "stt_failed");
}
