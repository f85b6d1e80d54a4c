// Camcast - redundant camera publisher
// Main library entry point

pub mod config;
pub mod devices;
pub mod encoding;
pub mod gstreamer_init;
pub mod orchestrator;
pub mod pipeline;
pub mod preview;
pub mod publish;

pub use config::PublisherConfig;
pub use orchestrator::{PublisherOrchestrator, StartupError};
