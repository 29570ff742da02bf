use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::DEFAULT_PROMPT;
use crate::pipeline::{Rendered, VoiceOver};

pub type AppState = Arc<VoiceOver>;

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(show_form))
        .route("/generate", post(generate))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, max_upload_bytes: usize) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Video voice over running on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state, max_upload_bytes)).await?;
    Ok(())
}

pub enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Internal(err) => {
                error!("Voice over failed: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        let body = format!(r#"<p class="error">{}</p>"#, escape_html(&message));
        (status, Html(page(DEFAULT_PROMPT, &body))).into_response()
    }
}

async fn show_form() -> Html<String> {
    Html(page(DEFAULT_PROMPT, ""))
}

struct Upload {
    video: Vec<u8>,
    file_name: Option<String>,
    prompt: String,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let bad_request = |err: axum::extract::multipart::MultipartError| AppError::BadRequest(err.body_text());

    let mut video = None;
    let mut file_name = None;
    let mut prompt = String::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("video") => {
                file_name = field.file_name().map(str::to_owned);
                let bytes = field.bytes().await.map_err(bad_request)?;
                if !bytes.is_empty() {
                    video = Some(bytes.to_vec());
                }
            }
            Some("prompt") => prompt = field.text().await.map_err(bad_request)?,
            _ => {}
        }
    }

    let video = video.ok_or_else(|| AppError::BadRequest("Choose a video file first.".to_owned()))?;
    if prompt.trim().is_empty() {
        prompt = DEFAULT_PROMPT.to_owned();
    }
    Ok(Upload {
        video,
        file_name,
        prompt,
    })
}

async fn generate(State(voice_over): State<AppState>, multipart: Multipart) -> Result<Html<String>, AppError> {
    let upload = read_upload(multipart).await?;
    info!(
        "Generating voice over for {} ({} bytes)",
        upload.file_name.as_deref().unwrap_or("upload"),
        upload.video.len()
    );
    let rendered = voice_over
        .render_upload(&upload.video, upload.file_name.as_deref(), &upload.prompt)
        .await?;
    Ok(Html(page(&upload.prompt, &result_section(&rendered))))
}

fn result_section(rendered: &Rendered) -> String {
    use base64::prelude::BASE64_STANDARD;

    format!(
        r#"<section class="result">
<p>{}</p>
<video controls src="data:video/mp4;base64,{}"></video>
</section>"#,
        escape_html(&rendered.narration),
        BASE64_STANDARD.encode(&rendered.video)
    )
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(prompt: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Video voice over</title>
<style>
body {{ font-family: sans-serif; max-width: 48rem; margin: 2rem auto; padding: 0 1rem; }}
textarea {{ width: 100%; min-height: 6rem; }}
video {{ width: 100%; margin: 1rem 0; }}
.error {{ color: #b00020; }}
</style>
</head>
<body>
<h1>Video voice over &#x1F426;</h1>
<form method="post" action="/generate" enctype="multipart/form-data">
<p><label>Choose a file <input type="file" name="video" accept="video/*" required></label></p>
<video id="preview" controls hidden></video>
<p><label>Prompt<br><textarea name="prompt">{}</textarea></label></p>
<button type="submit">Generate</button>
</form>
{}
<script>
document.querySelector('input[name="video"]').addEventListener('change', (event) => {{
  const preview = document.getElementById('preview');
  const file = event.target.files[0];
  preview.hidden = !file;
  if (file) preview.src = URL.createObjectURL(file);
}});
document.querySelector('form').addEventListener('submit', (event) => {{
  const button = event.target.querySelector('button');
  button.disabled = true;
  button.textContent = 'Processing...';
}});
</script>
</body>
</html>
"#,
        escape_html(prompt),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_in_narration() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn form_prefills_prompt_and_posts_multipart() {
        let html = page(DEFAULT_PROMPT, "");
        assert!(html.contains(r#"enctype="multipart/form-data""#));
        assert!(html.contains(r#"name="video""#));
        assert!(html.contains("quick product demo walkthrough"));
    }

    #[test]
    fn result_embeds_video_and_narration() {
        let rendered = Rendered {
            narration: "Click <Save>.".to_owned(),
            video: vec![0, 1, 2],
            duration_secs: 1.0,
        };
        let section = result_section(&rendered);
        assert!(section.contains("Click &lt;Save&gt;."));
        assert!(section.contains("data:video/mp4;base64,AAEC"));
    }
}
