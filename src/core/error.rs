use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::frame_extractor::pipeline::RunSummary;

pub type Result<T> = std::result::Result<T, KeyframeError>;

#[derive(Debug, Error)]
pub enum KeyframeError {
    #[error("frame buffer is full")]
    Full,
    #[error("frame buffer is empty")]
    Empty,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("frame buffer is closed")]
    Closed,
    #[error("frame {index} needs {bytes} bytes, more than the {budget} byte budget")]
    FrameTooLarge { index: u64, bytes: usize, budget: usize },
    #[error("analysis failed on frame {index}: {reason}")]
    Analysis { index: u64, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    #[error("JSON5 config error: {0}")]
    Json5(#[from] json5::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupt stream: {0}")]
    Decode(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("threshold search found no candidate after {iterations} iterations")]
    NoConvergence { iterations: u32 },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("run cancelled")]
    Cancelled,
}

impl KeyframeError {
    pub fn analysis(index: u64, reason: impl Into<String>) -> Self {
        KeyframeError::Analysis {
            index,
            reason: reason.into(),
        }
    }

    /// 可重试的错误：超时、瞬时编解码错误、一般 IO 错误
    pub fn is_recoverable(&self) -> bool {
        match self {
            KeyframeError::Timeout(_)
            | KeyframeError::Transient(_)
            | KeyframeError::Full
            | KeyframeError::Empty => true,
            KeyframeError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::Unsupported
            ),
            _ => false,
        }
    }

    /// 仅影响单帧的错误：跳过该帧，不重试，也不终止运行
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            KeyframeError::Analysis { .. } | KeyframeError::FrameTooLarge { .. }
        )
    }

    /// Short machine-readable label used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            KeyframeError::Full => "full",
            KeyframeError::Empty => "empty",
            KeyframeError::Timeout(_) => "timeout",
            KeyframeError::Closed => "closed",
            KeyframeError::FrameTooLarge { .. } => "frame_too_large",
            KeyframeError::Analysis { .. } => "analysis",
            KeyframeError::Io(_) => "io",
            KeyframeError::Image(_) => "image",
            KeyframeError::Json5(_) | KeyframeError::Json(_) => "config_parse",
            KeyframeError::UnsupportedFormat(_) => "unsupported_format",
            KeyframeError::Decode(_) => "decode",
            KeyframeError::Transient(_) => "transient",
            KeyframeError::NoConvergence { .. } => "no_convergence",
            KeyframeError::Config(_) => "config",
            KeyframeError::Cancelled => "cancelled",
        }
    }
}

/// A run that stopped early. Carries the counts gathered before the stop so
/// callers can still report what was written.
#[derive(Debug, Error)]
#[error("run aborted at frame {frame_index:?} after {elapsed:?} ({retries} retries): {source}")]
pub struct RunError {
    #[source]
    pub source: KeyframeError,
    pub frame_index: Option<u64>,
    pub elapsed: Duration,
    pub retries: u32,
    pub summary: RunSummary,
}

impl RunError {
    pub fn before_start(source: KeyframeError) -> Self {
        Self {
            source,
            frame_index: None,
            elapsed: Duration::ZERO,
            retries: 0,
            summary: RunSummary::default(),
        }
    }
}

/// Serializable view of a per-frame failure for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct FrameFailure {
    pub index: Option<u64>,
    pub kind: String,
    pub message: String,
}

impl FrameFailure {
    pub fn new(index: Option<u64>, error: &KeyframeError) -> Self {
        Self {
            index,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(KeyframeError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(KeyframeError::Transient("codec hiccup".into()).is_recoverable());
        assert!(KeyframeError::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "interrupted"
        ))
        .is_recoverable());

        assert!(!KeyframeError::Decode("bad container".into()).is_recoverable());
        assert!(!KeyframeError::UnsupportedFormat("mkv".into()).is_recoverable());
        assert!(!KeyframeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "garbage"
        ))
        .is_recoverable());
    }

    #[test]
    fn test_analysis_error_carries_index() {
        let err = KeyframeError::analysis(42, "zero-sized frame");
        assert!(err.to_string().contains("42"));
        assert_eq!(err.kind(), "analysis");
    }

    #[test]
    fn test_frame_local_errors_are_not_retried() {
        let corrupt = KeyframeError::analysis(1, "invalid PNG signature");
        assert!(corrupt.is_frame_local());
        assert!(!corrupt.is_recoverable());

        assert!(!KeyframeError::Decode("moov atom missing".into()).is_frame_local());
        assert!(!KeyframeError::Transient("decoder busy".into()).is_frame_local());
    }
}
