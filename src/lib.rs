pub mod config;
pub mod episode;
pub mod error;
pub mod llm;
pub mod media;
pub mod pipeline;
pub mod segment;
pub mod stages;
pub mod transcript;

pub use config::Config;
pub use episode::{Episode, EpisodeStatus};
pub use pipeline::{Orchestrator, RunRequest};
