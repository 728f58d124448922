// Core pipeline library modules

pub mod analysis;
pub mod classify;
pub mod config;
pub mod crf_search;
pub mod encoder;
pub mod events;
pub mod models;
pub mod notify;
pub mod parser;
pub mod pipeline;
pub mod postprocess;
pub mod rules;
pub mod runner;
pub mod startup;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod watchdog;

// Re-export commonly used types
pub use config::Settings;
pub use models::{Stage, Video, VideoState, Vmaf};
pub use store::Store;
pub use supervisor::{run_daemon, Supervisor};
