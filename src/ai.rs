use std::path::Path;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::Error;

/// Appends the length budget to the user's prompt so the narration fits the
/// clip when read aloud.
pub fn budget_prompt(prompt: &str, duration_secs: f64, words_per_second: f64) -> String {
    let word_budget = (duration_secs * words_per_second).floor() as u64;
    format!(
        "{prompt}(This video is ONLY {duration_secs:.1} seconds long, so make sure the voice over MUST be able to be explained in less than {word_budget} words)"
    )
}

async fn with_timeout<T, E>(
    operation: &'static str,
    after: Duration,
    future: impl std::future::Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout { operation, after }.into()),
    }
}

/// Backoff that gives up after the first failure. The client otherwise
/// re-sends rate limited requests until its own deadline.
fn single_attempt() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

/// Turns sampled frames into a narration script with a vision chat model.
pub struct Narrator {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl Narrator {
    pub fn new(settings: &Settings) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(&settings.api_key)
            .with_api_base(&settings.api_base);
        Self {
            client: Client::with_config(config).with_backoff(single_attempt()),
            model: settings.vision_model.clone(),
            max_tokens: settings.max_tokens,
            timeout: settings.narration_timeout(),
        }
    }

    fn request(&self, prompt: &str, frames: Vec<String>) -> anyhow::Result<CreateChatCompletionRequest> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(self.max_tokens)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(
                        [
                            vec![ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartTextArgs::default()
                                    .text(prompt)
                                    .build()?,
                            )],
                            frames
                                .into_iter()
                                .map(|frame| -> Result<_, OpenAIError> {
                                    Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                        ChatCompletionRequestMessageContentPartImageArgs::default()
                                            .image_url(ImageUrlArgs::default().url(frame).build()?)
                                            .build()?,
                                    ))
                                })
                                .collect::<Result<_, _>>()?,
                        ]
                        .concat(),
                    ))
                    .build()?,
            )])
            .build()?;
        Ok(request)
    }

    pub async fn narrate(&self, prompt: &str, frames: Vec<String>) -> anyhow::Result<String> {
        if frames.is_empty() {
            return Err(Error::NoFrames.into());
        }
        info!("Requesting narration from {} with {} frames", self.model, frames.len());
        let request = self.request(prompt, frames)?;

        let response = with_timeout(
            "narration request",
            self.timeout,
            self.client.chat().create(request),
        )
        .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(Error::EmptyNarration)?;
        debug!("Narration: {text}");
        Ok(text)
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// Reads a narration aloud through the speech endpoint.
pub struct SpeechSynthesizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    voice: String,
    format: String,
    timeout: Duration,
}

impl SpeechSynthesizer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/audio/speech", settings.api_base.trim_end_matches('/')),
            api_key: settings.api_key.clone(),
            model: settings.speech_model.clone(),
            voice: settings.voice.clone(),
            format: settings.speech_format.clone(),
            timeout: settings.speech_timeout(),
        }
    }

    /// File extension of the audio this synthesizer produces.
    pub fn extension(&self) -> &str {
        &self.format
    }

    /// Synthesizes `text` and writes the returned audio to `output_path`.
    pub async fn synthesize(&self, text: &str, output_path: &Path) -> anyhow::Result<()> {
        info!("Synthesizing {} characters with voice {}", text.len(), self.voice);
        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                response_format: &self.format,
            });

        let response = with_timeout("speech request", self.timeout, request.send()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::SpeechRequest {
                status: status.as_u16(),
            }
            .into());
        }

        let audio = with_timeout("speech download", self.timeout, response.bytes()).await?;
        tokio::fs::write(output_path, &audio).await?;
        debug!("Wrote {} bytes of speech to {}", audio.len(), output_path.display());
        Ok(())
    }
}
