//! 关键帧提取流水线
//!
//! 核心流程：
//! 1. 有界帧缓冲 - 解码与分析解耦，按帧数和内存双重限额施加背压
//! 2. 并行分析 - 工作线程计算单帧质量与比较签名
//! 3. 串行选择 - 状态机 + 缓存窗口，按到达顺序决定保留或丢弃
//! 4. 阈值推断 - 按目标关键帧数二分搜索相似度阈值

pub mod analyzer;
pub mod buffer;
pub mod cache;
pub mod inference;
pub mod pipeline;
pub mod resilience;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod testing;

pub use analyzer::{AnalysisResult, AnalyzerSettings, FrameAnalyzer, FrameSignals, PreparedFrame};
pub use buffer::{BufferStats, BufferedFrame, FrameBuffer, Rejected, SlotLease};
pub use cache::{CacheEntry, FrameCache};
pub use inference::{
    InferencePhase, InferenceProgress, ThresholdEstimate, ThresholdInference, ThresholdSearch,
};
pub use pipeline::{
    CancelToken, FrameExtractor, KeyframeRecord, ProgressCallback, ProgressUpdate, RunSummary,
};
pub use resilience::{RetryError, RetryPolicy, Retried};
pub use state_machine::{
    Keyframe, KeyframeSelector, SelectorAction, SelectorInput, SelectorState, Verdict,
};
