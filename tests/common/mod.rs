#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use voiceover::Settings;

/// Media fixtures are generated with the ffmpeg CLI. Tests that need them
/// return early when it is missing.
pub fn ffmpeg_available() -> bool {
    let available = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);
    if !available {
        eprintln!("ffmpeg not found on PATH, skipping");
    }
    available
}

fn ffmpeg(args: &[&str]) {
    let output = Command::new("ffmpeg")
        .args(["-y", "-loglevel", "error"])
        .args(args)
        .output()
        .expect("Failed to execute ffmpeg");
    if !output.status.success() {
        panic!("ffmpeg failed: {}", String::from_utf8_lossy(&output.stderr));
    }
}

/// A silent 160x120 test pattern at 25 fps.
pub fn make_video(path: &Path, duration_secs: u32) {
    let source = format!("testsrc=duration={duration_secs}:size=160x120:rate=25");
    ffmpeg(&[
        "-f",
        "lavfi",
        "-i",
        &source,
        "-c:v",
        "mpeg4",
        "-pix_fmt",
        "yuv420p",
        path.to_str().unwrap(),
    ]);
}

/// The same test pattern in an MPEG-TS container, whose streams count in
/// 1/90000 ticks.
pub fn make_transport_stream(path: &Path, duration_secs: u32) {
    let source = format!("testsrc=duration={duration_secs}:size=160x120:rate=25");
    ffmpeg(&[
        "-f",
        "lavfi",
        "-i",
        &source,
        "-c:v",
        "mpeg4",
        "-pix_fmt",
        "yuv420p",
        "-f",
        "mpegts",
        path.to_str().unwrap(),
    ]);
}

/// A mono sine tone, standing in for synthesized speech.
pub fn make_speech(path: &Path, duration_secs: u32) {
    let source = format!("sine=frequency=440:duration={duration_secs}");
    ffmpeg(&["-f", "lavfi", "-i", &source, "-c:a", "pcm_s16le", path.to_str().unwrap()]);
}

/// Plays the two OpenAI endpoints the pipeline talks to and records what it
/// was sent.
pub struct Stub {
    pub narration: String,
    pub chat_status: StatusCode,
    pub speech_status: StatusCode,
    pub speech_audio: Vec<u8>,
    pub speech_delay: Duration,
    pub chat_requests: Mutex<Vec<Value>>,
    pub speech_requests: Mutex<Vec<Value>>,
}

impl Stub {
    fn build(narration: &str, speech_status: StatusCode, speech_audio: Vec<u8>) -> Self {
        Self {
            narration: narration.to_owned(),
            chat_status: StatusCode::OK,
            speech_status,
            speech_audio,
            speech_delay: Duration::ZERO,
            chat_requests: Mutex::new(Vec::new()),
            speech_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn new(narration: &str, speech_status: StatusCode, speech_audio: Vec<u8>) -> Arc<Self> {
        Arc::new(Self::build(narration, speech_status, speech_audio))
    }

    /// Every chat completion is answered with `status` and an OpenAI style
    /// error body.
    pub fn failing_chat(status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            chat_status: status,
            ..Self::build("unused", StatusCode::OK, Vec::new())
        })
    }

    /// Speech succeeds, but only after `delay`.
    pub fn slow_speech(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            speech_delay: delay,
            ..Self::build("unused", StatusCode::OK, b"late".to_vec())
        })
    }
}

async fn chat_completions(State(stub): State<Arc<Stub>>, Json(body): Json<Value>) -> Response {
    stub.chat_requests.lock().unwrap().push(body);
    if !stub.chat_status.is_success() {
        let error = json!({
            "error": {
                "message": "Rate limit reached for requests",
                "type": "requests",
                "param": null,
                "code": null
            }
        });
        return (stub.chat_status, Json(error)).into_response();
    }
    Json(json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "created": 0,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": stub.narration },
            "finish_reason": "stop"
        }]
    }))
    .into_response()
}

async fn speech(State(stub): State<Arc<Stub>>, Json(body): Json<Value>) -> impl IntoResponse {
    stub.speech_requests.lock().unwrap().push(body);
    tokio::time::sleep(stub.speech_delay).await;
    (stub.speech_status, stub.speech_audio.clone())
}

pub async fn spawn_stub(stub: Arc<Stub>) -> SocketAddr {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/audio/speech", post(speech))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn settings(addr: SocketAddr, scratch_dir: &Path) -> Settings {
    settings_with(addr, scratch_dir, &[])
}

pub fn settings_with(addr: SocketAddr, scratch_dir: &Path, extra: &[&str]) -> Settings {
    let api_base = format!("http://{addr}/v1");
    let mut args = vec![
        "voiceover",
        "--api-key",
        "sk-test",
        "--api-base",
        &api_base,
        "--speech-format",
        "wav",
        "--scratch-dir",
        scratch_dir.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    Settings::try_parse_from(args).unwrap()
}
