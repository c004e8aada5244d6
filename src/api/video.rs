//! 视频关键帧提取接口

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::core::config::ExtractorConfig;
use crate::core::error::{KeyframeError, Result, RunError};
use crate::core::video::{open_source, DefaultScorer, FrameScorer, FrameSource};
use crate::frame_extractor::analyzer::{AnalyzerSettings, FrameAnalyzer};
use crate::frame_extractor::inference::{InferenceProgress, ThresholdEstimate, ThresholdInference};
use crate::frame_extractor::pipeline::{CancelToken, FrameExtractor, ProgressUpdate, RunSummary};
use crate::frame_extractor::resilience::RetryPolicy;

/// 视频关键帧提取器 - 相似度去重 + 质量择优
///
/// ```no_run
/// use keyframe_lib::{ExtractorConfig, VideoKeyframeExtractor};
///
/// let extractor = VideoKeyframeExtractor::create(ExtractorConfig::default()).unwrap();
/// let summary = extractor
///     .extract("clip.yuv".as_ref(), "out".as_ref())
///     .unwrap();
/// println!("kept {} of {}", summary.kept, summary.processed);
/// ```
pub struct VideoKeyframeExtractor {
    config: ExtractorConfig,
    scorer: Arc<dyn FrameScorer>,
    cancel: CancelToken,
}

impl VideoKeyframeExtractor {
    /// 校验配置并创建提取器
    pub fn create(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        info!("🎬 VideoKeyframeExtractor: created");
        Ok(Self {
            config,
            scorer: Arc::new(DefaultScorer::new()),
            cancel: CancelToken::new(),
        })
    }

    /// Loads a JSON5 config file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::create(ExtractorConfig::load(path)?)
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn FrameScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// 请求停止；正在处理的帧会完成后再返回
    pub fn cancel(&self) {
        info!("🛑 VideoKeyframeExtractor: cancel requested");
        self.cancel.cancel();
    }

    fn analyzer(&self) -> FrameAnalyzer {
        FrameAnalyzer::new(
            Arc::clone(&self.scorer),
            AnalyzerSettings::from_config(&self.config),
        )
    }

    fn pipeline(&self) -> FrameExtractor {
        FrameExtractor::new(self.config.clone())
            .with_scorer(Arc::clone(&self.scorer))
            .with_cancel_token(self.cancel.clone())
    }

    /// 推断使输出接近 `target` 个关键帧的相似度阈值
    pub fn infer_threshold(&self, input: &Path, target: usize) -> Result<ThresholdEstimate> {
        let mut source = open_source(input, &self.config)?;
        self.infer_from_source(&mut source, target)
    }

    /// 同 [`Self::infer_threshold`]，采样与搜索阶段通过 `progress` 汇报进度
    pub fn infer_threshold_with_progress<F>(
        &self,
        input: &Path,
        target: usize,
        progress: F,
    ) -> Result<ThresholdEstimate>
    where
        F: Fn(InferenceProgress),
    {
        let mut source = open_source(input, &self.config)?;
        self.estimate(&mut source, target, Some(&progress))
    }

    pub fn infer_from_source(
        &self,
        source: &mut dyn FrameSource,
        target: usize,
    ) -> Result<ThresholdEstimate> {
        self.estimate(source, target, None)
    }

    fn estimate(
        &self,
        source: &mut dyn FrameSource,
        target: usize,
        progress: Option<&dyn Fn(InferenceProgress)>,
    ) -> Result<ThresholdEstimate> {
        let analyzer = self.analyzer();
        let policy = RetryPolicy::from_config(&self.config.retry);
        let mut inference = ThresholdInference::new(&analyzer, &self.config.inference, &policy);
        if let Some(progress) = progress {
            inference = inference.with_progress(progress);
        }
        inference.estimate(source, target)
    }

    /// 从文件或图片目录提取关键帧到 `output_dir`
    ///
    /// With `target_frames` set, the input is read twice: once to sample
    /// for threshold inference, once for extraction.
    pub fn extract(&self, input: &Path, output_dir: &Path) -> std::result::Result<RunSummary, RunError> {
        self.extract_with_progress(input, output_dir, |_| {})
    }

    pub fn extract_with_progress<F>(
        &self,
        input: &Path,
        output_dir: &Path,
        progress: F,
    ) -> std::result::Result<RunSummary, RunError>
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        info!("📂 Extracting {} -> {}", input.display(), output_dir.display());
        let mut pipeline = self.pipeline().on_progress(progress);

        if let Some(target) = self.config.target_frames {
            if self.config.enable_keyframes {
                match self.infer_threshold(input, target) {
                    Ok(estimate) => pipeline = pipeline.with_inferred_threshold(estimate),
                    Err(KeyframeError::NoConvergence { iterations }) => warn!(
                        "⚠️ Threshold inference gave up after {} iterations, using {}",
                        iterations, self.config.similarity_threshold
                    ),
                    Err(e) => return Err(RunError::before_start(e)),
                }
            }
        }

        let mut source = open_source(input, &self.config).map_err(RunError::before_start)?;
        pipeline.run(&mut source, output_dir)
    }

    /// Runs on an already opened source, using the configured threshold.
    pub fn extract_source(
        &self,
        source: &mut dyn FrameSource,
        output_dir: &Path,
    ) -> std::result::Result<RunSummary, RunError> {
        if self.config.target_frames.is_some() {
            warn!("⚠️ target_frames needs a re-readable input, using the configured threshold");
        }
        self.pipeline().run(source, output_dir)
    }
}

impl Drop for VideoKeyframeExtractor {
    fn drop(&mut self) {
        info!("🗑️ VideoKeyframeExtractor: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::video::{output_file_name, Frame, FrameMetadata, LumaPlane, ScoreError};
    use crate::core::OutputFormat;
    use crate::frame_extractor::inference::InferencePhase;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    /// 每 `step` 张图片切换一次画面的 PNG 序列
    fn write_sequence(dir: &Path, count: u32, step: u32) {
        for i in 0..count {
            let scene = i / step;
            let img = GrayImage::from_fn(32, 32, |x, y| {
                let v = (x.wrapping_mul(31 + scene * 17) ^ y.wrapping_mul(7 + scene * 29)) % 256;
                Luma([v as u8])
            });
            img.save(dir.join(format!("shot_{:03}.png", i))).unwrap();
        }
    }

    #[test]
    fn test_extract_image_sequence() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_sequence(input.path(), 12, 4);

        let config = ExtractorConfig {
            similarity_threshold: 0.95,
            threads: 2,
            ..Default::default()
        };
        let extractor = VideoKeyframeExtractor::create(config).unwrap();
        let summary = extractor.extract(input.path(), output.path()).unwrap();

        assert_eq!(summary.processed, 12);
        let kept: Vec<u64> = summary.keyframes.iter().map(|k| k.index).collect();
        assert_eq!(kept, vec![0, 4, 8]);
        assert!(output
            .path()
            .join(output_file_name(4, OutputFormat::Png))
            .exists());
    }

    #[test]
    fn test_extract_with_target_frames_records_inference() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_sequence(input.path(), 12, 4);

        let config = ExtractorConfig {
            target_frames: Some(3),
            threads: 2,
            ..Default::default()
        };
        let summary = VideoKeyframeExtractor::create(config)
            .unwrap()
            .extract(input.path(), output.path())
            .unwrap();

        let estimate = summary.inference.as_ref().unwrap();
        assert_eq!(estimate.estimated_count, 3);
        assert_eq!(summary.similarity_threshold, estimate.threshold);
        assert_eq!(summary.kept, 3);
    }

    #[test]
    fn test_corrupt_image_in_sequence_is_skipped_once() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        write_sequence(input.path(), 4, 1);
        std::fs::write(input.path().join("shot_001.png"), b"not a png at all").unwrap();

        let config = ExtractorConfig {
            enable_keyframes: false,
            threads: 2,
            ..Default::default()
        };
        let extractor = VideoKeyframeExtractor::create(config).unwrap();
        let summary = extractor.extract(input.path(), output.path()).unwrap();

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.kept, 3);
        assert_eq!(summary.skipped_on_error, 1);
        assert_eq!(summary.retries, 0);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].index, Some(1));
        let kept: Vec<u64> = summary.keyframes.iter().map(|k| k.index).collect();
        assert_eq!(kept, vec![0, 2, 3]);
    }

    #[test]
    fn test_infer_threshold_reports_progress() {
        let input = TempDir::new().unwrap();
        write_sequence(input.path(), 12, 4);

        let extractor = VideoKeyframeExtractor::create(ExtractorConfig::default()).unwrap();
        let updates = std::sync::Mutex::new(Vec::new());
        let estimate = extractor
            .infer_threshold_with_progress(input.path(), 3, |update| {
                updates.lock().unwrap().push(update)
            })
            .unwrap();

        let updates = updates.into_inner().unwrap();
        assert!(!updates.is_empty());
        assert_eq!(updates[0].phase, InferencePhase::Sampling);
        let last = updates.last().unwrap();
        assert_eq!(last.phase, InferencePhase::Searching);
        assert_eq!(last.fraction, 1.0);
        assert!(estimate.iterations >= 1);
    }

    #[test]
    fn test_missing_input_fails_before_start() {
        let output = TempDir::new().unwrap();
        let extractor = VideoKeyframeExtractor::create(ExtractorConfig::default()).unwrap();
        let err = extractor
            .extract(Path::new("/nonexistent/clip.mp4"), output.path())
            .unwrap_err();
        assert_eq!(err.frame_index, None);
        assert_eq!(err.summary.processed, 0);
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let config = ExtractorConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            VideoKeyframeExtractor::create(config),
            Err(KeyframeError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extractor.json5");
        std::fs::write(
            &path,
            "{ output_format: 'jpeg', quality: 85, similarity_threshold: 0.8, cache_size: 4 }",
        )
        .unwrap();

        let extractor = VideoKeyframeExtractor::from_config_file(&path).unwrap();
        assert_eq!(extractor.config().output_format, OutputFormat::Jpeg);
        assert_eq!(extractor.config().cache_size, 4);
    }

    /// 所有帧互不相似，质量相同
    struct DistinctScorer;

    impl FrameScorer for DistinctScorer {
        fn sharpness(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn noise(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.1)
        }
        fn contrast(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn exposure(&self, _: &LumaPlane) -> std::result::Result<f32, ScoreError> {
            Ok(0.5)
        }
        fn optical_flow_magnitude(
            &self,
            _: &LumaPlane,
            _: &LumaPlane,
        ) -> std::result::Result<f32, ScoreError> {
            Ok(1.0)
        }
        fn structural_similarity(
            &self,
            _: &LumaPlane,
            _: &LumaPlane,
        ) -> std::result::Result<f32, ScoreError> {
            Ok(0.0)
        }
    }

    #[test]
    fn test_custom_scorer_on_memory_source() {
        let output = TempDir::new().unwrap();
        let frames = (0..5)
            .map(|i| Frame::new(8, 8, vec![128u8; 256], i * 40, i))
            .collect();
        let mut source = crate::core::video::MemorySource::new(25.0, frames);

        let config = ExtractorConfig {
            threads: 2,
            write_report: false,
            ..Default::default()
        };
        let summary = VideoKeyframeExtractor::create(config)
            .unwrap()
            .with_scorer(Arc::new(DistinctScorer))
            .extract_source(&mut source, output.path())
            .unwrap();
        assert_eq!(summary.kept, 5);
        let expected = FrameMetadata {
            sharpness: 0.5,
            noise: 0.1,
            contrast: 0.5,
            exposure: 0.5,
        };
        assert!(summary.keyframes.iter().all(|k| k.metadata == expected));
    }
}
