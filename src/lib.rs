//! CineMate: a watch-along companion that decides when to speak about a video and what to say.

pub mod arbiter;
pub mod audio_level;
pub mod backends;
pub mod capture;
pub mod config_loader;
pub mod control;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod memory;
pub mod modes;
pub mod orchestrator;
pub mod pipeline;
pub mod playback;
pub mod retry;
pub mod safety;
pub mod sampler;
pub mod types;
