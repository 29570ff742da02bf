use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no frames could be sampled from the video")]
    NoFrames,

    #[error("the vision model returned no narration")]
    EmptyNarration,

    #[error("speech request failed with status code {status}")]
    SpeechRequest { status: u16 },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}
