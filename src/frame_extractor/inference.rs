//! 阈值推断 - 二分搜索相似度阈值，使采样帧上的关键帧数接近目标值
//!
//! 采样帧只与紧邻的前一个采样帧比较（固定窗口 1），因此候选数随阈值单调。
//! 完整流水线使用更大的窗口，两者结果存在预期内的偏差。

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::core::config::InferenceConfig;
use crate::core::error::{KeyframeError, Result};
use crate::core::video::{FrameSource, LumaPlane};
use crate::frame_extractor::analyzer::FrameAnalyzer;
use crate::frame_extractor::resilience::{RetryPolicy, MAX_CONSECUTIVE_FAILURES};

/// Side of the luma grid used for the cheap comparison.
pub const INFERENCE_SIGNATURE_SIZE: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdEstimate {
    pub threshold: f32,
    pub estimated_count: usize,
    pub iterations: u32,
    /// Whether `estimated_count` is within the count tolerance of the target.
    pub converged: bool,
    /// Final `[low, high]` bounds of the search.
    pub bounds: (f32, f32),
    /// 每次试探的 (阈值, 数量)
    pub search_path: Vec<(f32, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePhase {
    Sampling,
    Searching,
}

/// 推断进度，`fraction` 为当前阶段内的完成比例
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InferenceProgress {
    pub phase: InferencePhase,
    pub fraction: f32,
}

/// Bisection over `[0, 1]` for a count function that grows with the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSearch {
    pub target: usize,
    pub count_tolerance: usize,
    pub tolerance: f32,
    pub max_iterations: u32,
}

impl ThresholdSearch {
    pub fn new(target: usize, config: &InferenceConfig) -> Self {
        Self {
            target,
            count_tolerance: config.count_tolerance_for(target),
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
        }
    }

    pub fn solve<F>(&self, mut count_at: F) -> Result<ThresholdEstimate>
    where
        F: FnMut(f32) -> usize,
    {
        let (mut low, mut high) = (0f32, 1f32);
        let mut best: Option<(f32, usize)> = None;
        let mut search_path = Vec::new();
        let distance = |count: usize| count.abs_diff(self.target);

        for iteration in 1..=self.max_iterations {
            let mid = (low + high) / 2.0;
            let count = count_at(mid);
            search_path.push((mid, count));
            debug!(
                "🔍 Iteration {}: threshold {:.4} -> {} frames (target {})",
                iteration, mid, count, self.target
            );

            if best.map_or(true, |(_, c)| distance(count) < distance(c)) {
                best = Some((mid, count));
            }
            if distance(count) <= self.count_tolerance {
                break;
            }

            // 阈值越高保留越多
            if count > self.target {
                high = mid;
            } else {
                low = mid;
            }
            if high - low <= self.tolerance {
                break;
            }
        }

        let (threshold, estimated_count) = best.ok_or(KeyframeError::NoConvergence {
            iterations: self.max_iterations,
        })?;
        Ok(ThresholdEstimate {
            threshold,
            estimated_count,
            iterations: search_path.len() as u32,
            converged: distance(estimated_count) <= self.count_tolerance,
            bounds: (low, high),
            search_path,
        })
    }
}

/// Counts candidates among samples for a threshold: the first sample plus
/// every sample less similar than `threshold` to its predecessor.
pub fn candidate_count(similarities: &[f32], sample_count: usize, threshold: f32) -> usize {
    if sample_count == 0 {
        return 0;
    }
    1 + similarities.iter().filter(|&&s| s < threshold).count()
}

pub struct ThresholdInference<'a> {
    analyzer: &'a FrameAnalyzer,
    config: &'a InferenceConfig,
    policy: &'a RetryPolicy,
    progress: Option<&'a dyn Fn(InferenceProgress)>,
}

impl<'a> ThresholdInference<'a> {
    pub fn new(analyzer: &'a FrameAnalyzer, config: &'a InferenceConfig, policy: &'a RetryPolicy) -> Self {
        Self {
            analyzer,
            config,
            policy,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn Fn(InferenceProgress)) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, phase: InferencePhase, fraction: f32) {
        if let Some(progress) = self.progress {
            progress(InferenceProgress {
                phase,
                fraction: fraction.clamp(0.0, 1.0),
            });
        }
    }

    fn stride(&self, frame_count: Option<u64>) -> u64 {
        if self.config.sample_stride > 0 {
            return self.config.sample_stride as u64;
        }
        match frame_count {
            Some(n) => n.div_ceil(self.config.max_samples.max(1) as u64).max(1),
            None => 1,
        }
    }

    /// 按步长采样，返回 (帧序号, 亮度签名)
    pub fn sample(&self, source: &mut dyn FrameSource) -> Result<Vec<(u64, LumaPlane)>> {
        let frame_count = source.metadata().frame_count;
        let stride = self.stride(frame_count);
        let expected = match frame_count {
            Some(n) => (n.div_ceil(stride) as usize).min(self.config.max_samples),
            None => self.config.max_samples,
        }
        .max(1);
        let mut samples = Vec::new();
        let mut position = 0u64;
        let mut failures = 0u32;

        while samples.len() < self.config.max_samples {
            let frame = match self.policy.call("read frame", || source.next_frame()) {
                Ok(retried) => retried.value,
                Err(e)
                    if (e.is_recoverable() || e.error.is_frame_local())
                        && failures + 1 < MAX_CONSECUTIVE_FAILURES =>
                {
                    warn!("⚠️ Sampling skipped an unreadable frame: {}", e);
                    if source.skip_frame().is_none() {
                        break;
                    }
                    failures += 1;
                    position += 1;
                    continue;
                }
                Err(e) => return Err(e.error),
            };
            failures = 0;
            let Some(frame) = frame else { break };

            if position % stride == 0 {
                match self.analyzer.signature(&frame, INFERENCE_SIGNATURE_SIZE) {
                    Ok(signature) => {
                        samples.push((frame.index, signature));
                        self.report(InferencePhase::Sampling, samples.len() as f32 / expected as f32);
                    }
                    Err(e) => warn!("⚠️ Sampling skipped frame {}: {}", frame.index, e),
                }
            }
            position += 1;
        }

        self.report(InferencePhase::Sampling, 1.0);
        debug!("🎯 Sampled {} frames (stride {})", samples.len(), stride);
        Ok(samples)
    }

    /// SSIM of each sample against its predecessor, computed in parallel.
    pub fn predecessor_similarities(&self, samples: &[(u64, LumaPlane)]) -> Result<Vec<f32>> {
        let scorer = self.analyzer.scorer();
        samples
            .par_windows(2)
            .map(|pair| {
                scorer
                    .structural_similarity(&pair[1].1, &pair[0].1)
                    .map_err(|e| KeyframeError::analysis(pair[1].0, e.0))
            })
            .collect()
    }

    pub fn estimate(&self, source: &mut dyn FrameSource, target: usize) -> Result<ThresholdEstimate> {
        if target == 0 {
            return Err(KeyframeError::Config("target_frames must be > 0".into()));
        }
        if let Some(frame_count) = source.metadata().frame_count {
            if target as u64 > frame_count {
                return Err(KeyframeError::Config(format!(
                    "target_frames {} exceeds the video's {} frames",
                    target, frame_count
                )));
            }
        }

        let samples = self.sample(source)?;
        if samples.is_empty() {
            warn!("⚠️ No frames could be sampled for threshold inference");
            return Err(KeyframeError::NoConvergence { iterations: 0 });
        }
        let similarities = self.predecessor_similarities(&samples)?;

        let search = ThresholdSearch::new(target, self.config);
        let mut iteration = 0u32;
        let estimate = search.solve(|t| {
            iteration += 1;
            self.report(
                InferencePhase::Searching,
                iteration as f32 / search.max_iterations.max(1) as f32,
            );
            candidate_count(&similarities, samples.len(), t)
        })?;
        self.report(InferencePhase::Searching, 1.0);
        info!(
            "🎯 Inferred threshold {:.4} -> ~{} keyframes in {} iterations (target {}, {} samples)",
            estimate.threshold,
            estimate.estimated_count,
            estimate.iterations,
            target,
            samples.len()
        );
        if !estimate.converged {
            warn!(
                "⚠️ Closest count {} misses target {} by more than the tolerance",
                estimate.estimated_count, target
            );
        }
        Ok(estimate)
    }
}
