pub mod api;
pub mod core;
pub mod frame_extractor;

pub use crate::api::video::VideoKeyframeExtractor;
pub use crate::core::{ExtractorConfig, KeyframeError, OutputFormat, RunError};
pub use crate::frame_extractor::{CancelToken, RunSummary, ThresholdEstimate};

pub fn init_logging(level: log::LevelFilter) {
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("keyframe_lib"),
        );
    }

    // 非 Android 平台由宿主安装 logger，这里只设置级别
    log::set_max_level(level);
}
