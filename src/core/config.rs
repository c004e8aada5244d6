//! 提取配置 - 对应命令行层的全部参数

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{KeyframeError, Result};

/// 输出图像格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    #[serde(rename = "webp")]
    WebP,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::WebP => "webp",
        }
    }

    /// PNG 为压缩等级 0-9（始终无损），JPEG/WebP 为保真度 0-100
    pub fn max_quality(self) -> u8 {
        match self {
            OutputFormat::Png => 9,
            OutputFormat::Jpeg | OutputFormat::WebP => 100,
        }
    }

    pub fn default_quality(self) -> u8 {
        match self {
            OutputFormat::Png => 6,
            OutputFormat::Jpeg | OutputFormat::WebP => 90,
        }
    }
}

/// Weights of the four quality signals in `quality_composite`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub sharpness: f32,
    pub noise: f32,
    pub contrast: f32,
    pub exposure: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            sharpness: 1.0,
            noise: 1.0,
            contrast: 1.0,
            exposure: 1.0,
        }
    }
}

impl QualityWeights {
    pub fn total(&self) -> f32 {
        self.sharpness + self.noise + self.contrast + self.exposure
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retry_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Uniform jitter factor; 0.25 spreads each delay over ±25%.
    pub jitter: f32,
    pub frame_timeout_ms: u64,
    pub video_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: 0.25,
            frame_timeout_ms: 10_000,
            video_timeout_secs: 3_600,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn video_timeout(&self) -> Duration {
        Duration::from_secs(self.video_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub max_samples: usize,
    /// 0 = derive from the frame count so the samples span the whole video.
    pub sample_stride: usize,
    pub max_iterations: u32,
    /// Bisection stops once the bound width drops to this value.
    pub tolerance: f32,
    /// Accepted distance from the target count; `None` uses 2% of the target.
    pub count_tolerance: Option<usize>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_samples: 600,
            sample_stride: 0,
            max_iterations: 50,
            tolerance: 0.002,
            count_tolerance: None,
        }
    }
}

impl InferenceConfig {
    pub fn count_tolerance_for(&self, target: usize) -> usize {
        self.count_tolerance
            .unwrap_or_else(|| ((target as f32) * 0.02).round() as usize)
    }
}

/// Geometry of a headerless raw I420 stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawVideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub output_format: OutputFormat,
    /// `None` picks the format's default.
    pub quality: Option<u8>,
    pub enable_keyframes: bool,
    pub similarity_threshold: f32,
    /// Runs threshold inference before extraction when set.
    pub target_frames: Option<usize>,
    /// Analysis worker count; 0 = one per CPU.
    pub threads: usize,
    /// Frame buffer slot count.
    pub buffer_size: usize,
    /// Cache window W.
    pub cache_size: usize,
    pub max_memory_mb: usize,
    pub motion_epsilon: f32,
    pub quality_floor: Option<f32>,
    pub quality_weights: QualityWeights,
    /// Side of the square luma grid used for motion and similarity.
    pub comparison_size: u32,
    /// Width the quality signals are measured at.
    pub analysis_width: u32,
    /// Candidates this many frames apart compete on quality; 0 disables.
    pub burst_frames: u32,
    pub retry: RetryConfig,
    pub inference: InferenceConfig,
    pub raw_video: Option<RawVideoConfig>,
    pub write_report: bool,
    pub log_level: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Png,
            quality: None,
            enable_keyframes: true,
            similarity_threshold: 0.90,
            target_frames: None,
            threads: 0,
            buffer_size: 32,
            cache_size: 5,
            max_memory_mb: 512,
            motion_epsilon: 0.01,
            quality_floor: None,
            quality_weights: QualityWeights::default(),
            comparison_size: 64,
            analysis_width: 320,
            burst_frames: 0,
            retry: RetryConfig::default(),
            inference: InferenceConfig::default(),
            raw_video: None,
            write_report: true,
            log_level: "info".to_string(),
        }
    }
}

impl ExtractorConfig {
    /// 高运动场景：阈值更低、窗口更大
    pub fn for_high_motion() -> Self {
        Self {
            similarity_threshold: 0.80,
            cache_size: 8,
            motion_epsilon: 0.03,
            burst_frames: 5,
            ..Default::default()
        }
    }

    /// 低运动场景（录屏、幻灯片）
    pub fn for_low_motion() -> Self {
        Self {
            similarity_threshold: 0.97,
            cache_size: 3,
            motion_epsilon: 0.002,
            ..Default::default()
        }
    }

    pub fn from_json5_str(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5_str(&text)
    }

    pub fn worker_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn effective_quality(&self) -> u8 {
        let format = self.output_format;
        self.quality
            .unwrap_or_else(|| format.default_quality())
            .min(format.max_quality())
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = 0.0f32..=1.0;
        if !unit.contains(&self.similarity_threshold) {
            return Err(KeyframeError::Config(format!(
                "similarity_threshold {} outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if !unit.contains(&self.motion_epsilon) {
            return Err(KeyframeError::Config(format!(
                "motion_epsilon {} outside [0, 1]",
                self.motion_epsilon
            )));
        }
        if let Some(floor) = self.quality_floor {
            if !unit.contains(&floor) {
                return Err(KeyframeError::Config(format!(
                    "quality_floor {} outside [0, 1]",
                    floor
                )));
            }
        }
        if let Some(quality) = self.quality {
            if quality > self.output_format.max_quality() {
                return Err(KeyframeError::Config(format!(
                    "quality {} exceeds {} for {:?}",
                    quality,
                    self.output_format.max_quality(),
                    self.output_format
                )));
            }
        }
        if self.target_frames == Some(0) {
            return Err(KeyframeError::Config("target_frames must be > 0".into()));
        }
        if self.buffer_size == 0 || self.cache_size == 0 {
            return Err(KeyframeError::Config(
                "buffer_size and cache_size must be > 0".into(),
            ));
        }
        if self.max_memory_mb == 0 {
            return Err(KeyframeError::Config("max_memory_mb must be > 0".into()));
        }
        if self.comparison_size < 8 || self.analysis_width < 8 {
            return Err(KeyframeError::Config(
                "comparison_size and analysis_width must be >= 8".into(),
            ));
        }
        let w = &self.quality_weights;
        if [w.sharpness, w.noise, w.contrast, w.exposure]
            .iter()
            .any(|v| *v < 0.0)
            || w.total() <= 0.0
        {
            return Err(KeyframeError::Config(
                "quality weights must be non-negative with a positive sum".into(),
            ));
        }
        if !(0.0f32..1.0).contains(&self.retry.jitter) {
            return Err(KeyframeError::Config(format!(
                "retry jitter {} outside [0, 1)",
                self.retry.jitter
            )));
        }
        let inference = &self.inference;
        if inference.max_samples < 2 || !(inference.tolerance > 0.0 && inference.tolerance < 1.0) {
            return Err(KeyframeError::Config(
                "inference needs max_samples >= 2 and tolerance in (0, 1)".into(),
            ));
        }
        if let Some(raw) = self.raw_video {
            if raw.width == 0 || raw.height == 0 || raw.width % 2 != 0 || raw.height % 2 != 0 {
                return Err(KeyframeError::Config(format!(
                    "raw video geometry {}x{} must be even and non-zero",
                    raw.width, raw.height
                )));
            }
            if raw.fps <= 0.0 {
                return Err(KeyframeError::Config("raw video fps must be > 0".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExtractorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_quality(), 6);
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(ExtractorConfig::for_high_motion().validate().is_ok());
        assert!(ExtractorConfig::for_low_motion().validate().is_ok());
        assert!(
            ExtractorConfig::for_low_motion().similarity_threshold
                > ExtractorConfig::for_high_motion().similarity_threshold
        );
    }

    #[test]
    fn test_json5_partial_config() {
        let text = r#"{
            // 录屏素材
            output_format: "jpeg",
            quality: 80,
            similarity_threshold: 0.95,
            retry: { retry_attempts: 5 },
        }"#;
        let config = ExtractorConfig::from_json5_str(text).unwrap();
        assert_eq!(config.output_format, OutputFormat::Jpeg);
        assert_eq!(config.effective_quality(), 80);
        assert_eq!(config.retry.retry_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.cache_size, 5);
    }

    #[test]
    fn test_png_quality_is_compression_level() {
        let text = r#"{ output_format: "png", quality: 12 }"#;
        let err = ExtractorConfig::from_json5_str(text).unwrap_err();
        assert!(matches!(err, KeyframeError::Config(_)));
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let config = ExtractorConfig {
            similarity_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ExtractorConfig {
            target_frames: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_count_tolerance_default() {
        let inference = InferenceConfig::default();
        assert_eq!(inference.count_tolerance_for(100), 2);
        assert_eq!(inference.count_tolerance_for(8), 0);
    }
}
