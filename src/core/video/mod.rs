pub mod frame;
pub mod metrics;
pub mod source;
pub mod writer;

pub use frame::{Frame, FrameMetadata, LumaPlane, RawFrame, VideoMetadata};
pub use metrics::{DefaultScorer, FrameScorer, QualityMetric, ScoreError};
pub use source::{open_source, FrameSource, ImageSequenceSource, MemorySource, RawYuvSource};
pub use writer::{output_file_name, FrameWriter, ImageFileWriter};
