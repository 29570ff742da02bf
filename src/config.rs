use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_PROMPT: &str = "These are frames of a quick product demo walkthrough. Create a short voiceover script that outline the key actions to take, that can be used along this product demo.";

pub const VOICES: [&str; 6] = ["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

/// Containers the speech endpoint can return that FFmpeg can also read back
/// without out-of-band format hints.
pub const SPEECH_FORMATS: [&str; 5] = ["mp3", "aac", "flac", "opus", "wav"];

// Shared by every subcommand; flattened into the CLI.
#[derive(Parser, Debug, Clone)]
pub struct Settings {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "OPENAI_API_BASE", default_value = "https://api.openai.com/v1")]
    pub api_base: String,

    #[arg(long, env = "VOICEOVER_VISION_MODEL", default_value = "gpt-4o")]
    pub vision_model: String,

    #[arg(long, default_value_t = 500)]
    pub max_tokens: u32,

    /// Keep one decoded frame out of every N.
    #[arg(long, default_value_t = 25, value_parser = clap::value_parser!(u32).range(1..))]
    pub frame_stride: u32,

    /// Longest side of a sampled frame, in pixels.
    #[arg(long, default_value_t = 768, value_parser = clap::value_parser!(u32).range(16..))]
    pub frame_max_dimension: u32,

    #[arg(long, env = "VOICEOVER_SPEECH_MODEL", default_value = "tts-1")]
    pub speech_model: String,

    #[arg(long, env = "VOICEOVER_VOICE", default_value = "onyx", value_parser = VOICES)]
    pub voice: String,

    #[arg(long, default_value = "mp3", value_parser = SPEECH_FORMATS)]
    pub speech_format: String,

    /// Spoken words budgeted per second of video.
    #[arg(long, default_value_t = 2.0)]
    pub words_per_second: f64,

    #[arg(long, default_value_t = 300)]
    pub narration_timeout_secs: u64,

    #[arg(long, default_value_t = 120)]
    pub speech_timeout_secs: u64,

    /// Directory that per-run scratch directories are created in.
    /// Defaults to the system temp dir.
    #[arg(long, env = "VOICEOVER_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,
}

impl Settings {
    pub fn narration_timeout(&self) -> Duration {
        Duration::from_secs(self.narration_timeout_secs)
    }

    pub fn speech_timeout(&self) -> Duration {
        Duration::from_secs(self.speech_timeout_secs)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
