pub mod config;
pub mod error;
pub mod video;

pub use config::{ExtractorConfig, OutputFormat};
pub use error::{KeyframeError, Result, RunError};
