mod common;

use axum::http::StatusCode;
use std::time::Duration;

use common::{settings, settings_with, spawn_stub, Stub};
use voiceover::ai::{Narrator, SpeechSynthesizer};
use voiceover::Error;

#[tokio::test]
async fn speech_failure_carries_status_code() {
    for status in [StatusCode::UNAUTHORIZED, StatusCode::TOO_MANY_REQUESTS, StatusCode::INTERNAL_SERVER_ERROR] {
        let stub = Stub::new("unused", status, b"{\"error\":{}}".to_vec());
        let addr = spawn_stub(stub.clone()).await;
        let scratch = tempfile::tempdir().unwrap();
        let synthesizer = SpeechSynthesizer::new(&settings(addr, scratch.path()));

        let target = scratch.path().join("narration.wav");
        let err = synthesizer.synthesize("Hello there.", &target).await.unwrap_err();

        match err.downcast_ref::<Error>() {
            Some(Error::SpeechRequest { status: code }) => assert_eq!(*code, status.as_u16()),
            other => panic!("expected a speech status error, got {other:?}"),
        }
        assert!(!target.exists());
        assert_eq!(stub.speech_requests.lock().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn speech_success_writes_audio_bytes() {
    let stub = Stub::new("unused", StatusCode::OK, b"RIFF-not-really".to_vec());
    let addr = spawn_stub(stub.clone()).await;
    let scratch = tempfile::tempdir().unwrap();
    let synthesizer = SpeechSynthesizer::new(&settings(addr, scratch.path()));

    let target = scratch.path().join("narration.wav");
    synthesizer.synthesize("Click the blue button.", &target).await.unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"RIFF-not-really");
    let request = stub.speech_requests.lock().unwrap()[0].clone();
    assert_eq!(request["input"], "Click the blue button.");
    assert_eq!(request["voice"], "onyx");
    assert_eq!(request["model"], "tts-1");
    assert_eq!(request["response_format"], "wav");
}

#[tokio::test]
async fn narration_sends_prompt_then_frames() {
    let stub = Stub::new("Open the dashboard, then click export.", StatusCode::OK, Vec::new());
    let addr = spawn_stub(stub.clone()).await;
    let scratch = tempfile::tempdir().unwrap();
    let narrator = Narrator::new(&settings(addr, scratch.path()));

    let frames = vec![
        "data:image/jpeg;base64,AAAA".to_owned(),
        "data:image/jpeg;base64,BBBB".to_owned(),
    ];
    let narration = narrator.narrate("Narrate this demo.", frames).await.unwrap();
    assert_eq!(narration, "Open the dashboard, then click export.");

    let request = stub.chat_requests.lock().unwrap()[0].clone();
    assert_eq!(request["model"], "gpt-4o");
    assert_eq!(request["max_tokens"], 500);
    let content = request["messages"][0]["content"].as_array().unwrap();
    assert_eq!(content.len(), 3);
    assert_eq!(content[0]["text"], "Narrate this demo.");
    assert_eq!(content[2]["image_url"]["url"], "data:image/jpeg;base64,BBBB");
}

#[tokio::test]
async fn blank_narration_is_an_error() {
    let stub = Stub::new("   ", StatusCode::OK, Vec::new());
    let addr = spawn_stub(stub).await;
    let scratch = tempfile::tempdir().unwrap();
    let narrator = Narrator::new(&settings(addr, scratch.path()));

    let err = narrator
        .narrate("Narrate this demo.", vec!["data:image/jpeg;base64,AAAA".to_owned()])
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyNarration)));
}

#[tokio::test]
async fn rate_limited_narration_is_sent_once() {
    let stub = Stub::failing_chat(StatusCode::TOO_MANY_REQUESTS);
    let addr = spawn_stub(stub.clone()).await;
    let scratch = tempfile::tempdir().unwrap();
    let narrator = Narrator::new(&settings_with(addr, scratch.path(), &["--narration-timeout-secs", "10"]));

    let err = narrator
        .narrate("Narrate this demo.", vec!["data:image/jpeg;base64,AAAA".to_owned()])
        .await
        .unwrap_err();

    assert!(
        !matches!(err.downcast_ref::<Error>(), Some(Error::Timeout { .. })),
        "rate limit should fail straight away, got {err:#}"
    );
    assert_eq!(stub.chat_requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn slow_speech_times_out() {
    let stub = Stub::slow_speech(Duration::from_secs(3));
    let addr = spawn_stub(stub).await;
    let scratch = tempfile::tempdir().unwrap();
    let synthesizer = SpeechSynthesizer::new(&settings_with(addr, scratch.path(), &["--speech-timeout-secs", "1"]));

    let target = scratch.path().join("narration.wav");
    let err = synthesizer.synthesize("Hello there.", &target).await.unwrap_err();

    match err.downcast_ref::<Error>() {
        Some(Error::Timeout { operation, after }) => {
            assert_eq!(*operation, "speech request");
            assert_eq!(*after, Duration::from_secs(1));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(!target.exists());
}
