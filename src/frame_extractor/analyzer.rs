//! 帧分析器
//!
//! 分两步：`prepare` 只依赖单帧（质量信号 + 比较用亮度签名），可在工作线程并行；
//! `decide` 依赖缓存窗口（运动量、窗口内最大 SSIM），由选择器串行调用。

use std::sync::Arc;

use crate::core::config::{ExtractorConfig, QualityWeights};
use crate::core::error::{KeyframeError, Result};
use crate::core::video::{Frame, FrameMetadata, FrameScorer, LumaPlane, ScoreError};
use crate::frame_extractor::cache::CacheEntry;

/// Per-frame analyzer output, consumed by the selector and then dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisResult {
    pub quality_composite: f32,
    pub motion_score: f32,
    pub similarity_to_cache: f32,
    pub is_candidate: bool,
}

impl AnalysisResult {
    /// 全量提取模式：跳过比较，强制为候选
    pub fn forced(quality_composite: f32) -> Self {
        Self {
            quality_composite,
            motion_score: 0.0,
            similarity_to_cache: 0.0,
            is_candidate: true,
        }
    }
}

/// 单帧信号（不依赖缓存）
#[derive(Debug, Clone)]
pub struct FrameSignals {
    pub metadata: FrameMetadata,
    pub signature: LumaPlane,
    pub quality: f32,
}

#[derive(Debug, Clone)]
pub struct PreparedFrame {
    pub frame: Frame,
    pub signals: FrameSignals,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    pub similarity_threshold: f32,
    pub motion_epsilon: f32,
    pub quality_floor: Option<f32>,
    pub weights: QualityWeights,
    pub comparison_size: u32,
    pub analysis_width: u32,
}

impl AnalyzerSettings {
    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            motion_epsilon: config.motion_epsilon,
            quality_floor: config.quality_floor,
            weights: config.quality_weights,
            comparison_size: config.comparison_size,
            analysis_width: config.analysis_width,
        }
    }
}

#[derive(Clone)]
pub struct FrameAnalyzer {
    scorer: Arc<dyn FrameScorer>,
    settings: AnalyzerSettings,
}

impl FrameAnalyzer {
    pub fn new(scorer: Arc<dyn FrameScorer>, settings: AnalyzerSettings) -> Self {
        Self { scorer, settings }
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    pub fn scorer(&self) -> &dyn FrameScorer {
        self.scorer.as_ref()
    }

    pub fn set_similarity_threshold(&mut self, threshold: f32) {
        self.settings.similarity_threshold = threshold.clamp(0.0, 1.0);
    }

    fn scoring_error(index: u64, error: ScoreError) -> KeyframeError {
        KeyframeError::analysis(index, error.0)
    }

    /// Square luma grid of side `size`, the basis of motion and similarity.
    pub fn signature(&self, frame: &Frame, size: u32) -> Result<LumaPlane> {
        Ok(frame.to_luma()?.downsample(size, size))
    }

    pub fn prepare(&self, frame: &Frame) -> Result<FrameSignals> {
        let luma = frame.to_luma()?;
        let measured = luma.fit_width(self.settings.analysis_width);
        let metadata = FrameMetadata::measure(self.scorer.as_ref(), &measured)
            .map_err(|e| Self::scoring_error(frame.index, e))?;
        let size = self.settings.comparison_size;

        Ok(FrameSignals {
            quality: metadata.composite(&self.settings.weights),
            metadata,
            signature: luma.downsample(size, size),
        })
    }

    /// Novelty decision for prepared signals against the cache window
    /// (oldest first).
    pub fn decide(
        &self,
        index: u64,
        signals: &FrameSignals,
        window: &[CacheEntry],
    ) -> Result<AnalysisResult> {
        let quality = signals.quality;
        let Some(latest) = window.last() else {
            // 首帧总是候选
            return Ok(AnalysisResult {
                quality_composite: quality,
                motion_score: 1.0,
                similarity_to_cache: 0.0,
                is_candidate: true,
            });
        };

        let motion = self
            .scorer
            .optical_flow_magnitude(&signals.signature, &latest.signature)
            .map_err(|e| Self::scoring_error(index, e))?;
        if motion < self.settings.motion_epsilon {
            return Ok(AnalysisResult {
                quality_composite: quality,
                motion_score: motion,
                similarity_to_cache: 1.0,
                is_candidate: false,
            });
        }

        // 与整个窗口比较，取最大相似度
        let mut similarity = 0f32;
        for entry in window {
            let s = self
                .scorer
                .structural_similarity(&signals.signature, &entry.signature)
                .map_err(|e| Self::scoring_error(index, e))?;
            similarity = similarity.max(s);
        }

        let passes_floor = self.settings.quality_floor.map_or(true, |floor| quality >= floor);
        Ok(AnalysisResult {
            quality_composite: quality,
            motion_score: motion,
            similarity_to_cache: similarity,
            is_candidate: similarity < self.settings.similarity_threshold && passes_floor,
        })
    }

    pub fn analyze(&self, frame: &Frame, window: &[CacheEntry]) -> Result<AnalysisResult> {
        let signals = self.prepare(frame)?;
        self.decide(frame.index, &signals, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::video::DefaultScorer;
    use crate::frame_extractor::testing::{noise_frame, uniform_frame};

    fn create_analyzer(threshold: f32) -> FrameAnalyzer {
        let config = ExtractorConfig {
            similarity_threshold: threshold,
            ..Default::default()
        };
        FrameAnalyzer::new(Arc::new(DefaultScorer::new()), AnalyzerSettings::from_config(&config))
    }

    fn entry(analyzer: &FrameAnalyzer, frame: Frame) -> CacheEntry {
        let signals = analyzer.prepare(&frame).unwrap();
        CacheEntry {
            frame: Arc::new(frame),
            metadata: signals.metadata,
            signature: Arc::new(signals.signature),
            quality: signals.quality,
        }
    }

    #[test]
    fn test_empty_window_is_candidate() {
        let analyzer = create_analyzer(0.95);
        let result = analyzer.analyze(&uniform_frame(32, 32, 0, 0), &[]).unwrap();
        assert!(result.is_candidate);
    }

    #[test]
    fn test_empty_window_ignores_quality_floor() {
        let config = ExtractorConfig {
            quality_floor: Some(0.99),
            ..Default::default()
        };
        let analyzer =
            FrameAnalyzer::new(Arc::new(DefaultScorer::new()), AnalyzerSettings::from_config(&config));
        let result = analyzer.analyze(&uniform_frame(32, 32, 0, 0), &[]).unwrap();
        assert!(result.quality_composite < 0.99);
        assert!(result.is_candidate);
    }

    #[test]
    fn test_static_frame_short_circuits() {
        let analyzer = create_analyzer(0.95);
        let window = vec![entry(&analyzer, noise_frame(32, 32, 7, 0))];
        let result = analyzer.analyze(&noise_frame(32, 32, 7, 1), &window).unwrap();
        assert!(!result.is_candidate);
        assert!(result.motion_score < 0.01);
        assert_eq!(result.similarity_to_cache, 1.0);
    }

    #[test]
    fn test_novel_frame_is_candidate() {
        let analyzer = create_analyzer(0.95);
        let window = vec![entry(&analyzer, noise_frame(32, 32, 1, 0))];
        let result = analyzer.analyze(&noise_frame(32, 32, 2, 1), &window).unwrap();
        assert!(result.is_candidate);
        assert!(result.similarity_to_cache < 0.5);
    }

    #[test]
    fn test_similarity_uses_whole_window() {
        let analyzer = create_analyzer(0.95);
        // 新帧与最近一帧不同，但与窗口中更早的一帧相同
        let window = vec![
            entry(&analyzer, noise_frame(32, 32, 1, 0)),
            entry(&analyzer, noise_frame(32, 32, 2, 1)),
        ];
        let result = analyzer.analyze(&noise_frame(32, 32, 1, 2), &window).unwrap();
        assert!(result.motion_score >= 0.01);
        assert!(result.similarity_to_cache > 0.99);
        assert!(!result.is_candidate);
    }

    #[test]
    fn test_quality_floor_excludes_flat_frames() {
        let config = ExtractorConfig {
            quality_floor: Some(0.6),
            ..Default::default()
        };
        let analyzer =
            FrameAnalyzer::new(Arc::new(DefaultScorer::new()), AnalyzerSettings::from_config(&config));
        let window = vec![entry(&analyzer, uniform_frame(32, 32, 20, 0))];
        let result = analyzer.analyze(&uniform_frame(32, 32, 230, 1), &window).unwrap();
        assert!(result.quality_composite < 0.6);
        assert!(!result.is_candidate);
    }

    #[test]
    fn test_malformed_frame_reports_index() {
        let analyzer = create_analyzer(0.95);
        let frame = Frame::new(8, 8, vec![0u8; 5], 0, 11);
        match analyzer.analyze(&frame, &[]) {
            Err(KeyframeError::Analysis { index, .. }) => assert_eq!(index, 11),
            other => panic!("expected analysis error, got {:?}", other),
        }
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let analyzer = create_analyzer(0.95);
        let frame = noise_frame(48, 32, 3, 0);
        let a = analyzer.prepare(&frame).unwrap();
        let b = analyzer.prepare(&frame).unwrap();
        assert_eq!(a.metadata, b.metadata);
        assert_eq!(a.quality, b.quality);
    }
}
