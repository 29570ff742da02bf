pub mod ai;
pub mod capture;
pub mod config;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod server;
pub mod workspace;

pub use config::Settings;
pub use error::Error;
pub use pipeline::{Rendered, VoiceOver};
