use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::ai::{budget_prompt, Narrator, SpeechSynthesizer};
use crate::config::Settings;
use crate::workspace::Workspace;
use crate::{capture, mux};

/// Result of one voice over run.
#[derive(Debug)]
pub struct Rendered {
    pub narration: String,
    pub video: Vec<u8>,
    pub duration_secs: f64,
}

/// Sample frames, narrate them, read the narration aloud and lay it over the
/// source video.
pub struct VoiceOver {
    narrator: Narrator,
    speech: SpeechSynthesizer,
    frame_stride: u32,
    frame_max_dimension: u32,
    words_per_second: f64,
    scratch_root: PathBuf,
}

async fn blocking<T, F>(task: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("media task panicked")?
}

impl VoiceOver {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        capture::init()?;
        Ok(Self {
            narrator: Narrator::new(settings),
            speech: SpeechSynthesizer::new(settings),
            frame_stride: settings.frame_stride,
            frame_max_dimension: settings.frame_max_dimension,
            words_per_second: settings.words_per_second,
            scratch_root: settings.scratch_root(),
        })
    }

    /// Runs the whole pipeline for a video on disk and writes the result to
    /// `output`. Returns the narration and the source duration.
    pub async fn render_file(
        &self,
        input: &Path,
        prompt: &str,
        narration_audio: &Path,
        output: &Path,
    ) -> anyhow::Result<(String, f64)> {
        let (stride, max_dimension) = (self.frame_stride, self.frame_max_dimension);
        let source = input.to_owned();
        let (frames, duration_secs) = blocking(move || {
            let duration = capture::video_duration(&source)?;
            let frames = capture::capture_base64(&source, stride, max_dimension)?;
            Ok((frames, duration))
        })
        .await
        .with_context(|| format!("sampling frames from {}", input.display()))?;

        let prompt = budget_prompt(prompt, duration_secs, self.words_per_second);
        let narration = self.narrator.narrate(&prompt, frames).await?;

        self.speech.synthesize(&narration, narration_audio).await?;

        let (video, audio, muxed) = (input.to_owned(), narration_audio.to_owned(), output.to_owned());
        blocking(move || mux::merge_audio_video(&video, &audio, &muxed))
            .await
            .context("merging narration into the video")?;

        Ok((narration, duration_secs))
    }

    /// Runs the pipeline for an uploaded video held in memory. Every
    /// intermediate file lives in a scratch directory that is gone by the
    /// time this returns, whether the run succeeded or not.
    pub async fn render_upload(
        &self,
        upload: &[u8],
        file_name: Option<&str>,
        prompt: &str,
    ) -> anyhow::Result<Rendered> {
        let workspace = Workspace::create(
            &self.scratch_root,
            crate::workspace::upload_extension(file_name),
            self.speech.extension(),
        )
        .context("creating a scratch directory")?;
        tokio::fs::write(workspace.upload(), upload).await?;
        info!("Stored {} byte upload in {}", upload.len(), workspace.path().display());

        let (narration, duration_secs) = self
            .render_file(workspace.upload(), prompt, workspace.narration(), workspace.output())
            .await?;
        let video = tokio::fs::read(workspace.output()).await?;

        workspace.close()?;
        Ok(Rendered {
            narration,
            video,
            duration_secs,
        })
    }
}
