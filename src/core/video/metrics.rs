//! Scoring primitives.
//!
//! Every kernel works on a [`LumaPlane`] and returns a scalar in `[0, 1]`.
//! The analyzer only talks to the [`FrameScorer`] trait, so hosts with
//! their own kernels (GPU SSIM, dense optical flow) can plug them in.

use thiserror::Error;

use super::frame::{FrameMetadata, LumaPlane};
use crate::core::config::QualityWeights;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct ScoreError(pub String);

pub type ScoreResult = std::result::Result<f32, ScoreError>;

const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
const SSIM_WINDOW: usize = 8;

/// Laplacian variance at which sharpness reaches 0.5.
const SHARPNESS_SCALE: f64 = 500.0;
/// Mean box-blur residual treated as fully noisy.
const NOISE_SCALE: f64 = 20.0;
/// Residual (grey levels) at which a block counts as fully changed.
const RESIDUAL_SCALE: f64 = 32.0;
const FLOW_BLOCK: usize = 8;
const FLOW_RADIUS: i32 = 2;

pub trait FrameScorer: Send + Sync {
    fn sharpness(&self, luma: &LumaPlane) -> ScoreResult;
    fn noise(&self, luma: &LumaPlane) -> ScoreResult;
    fn contrast(&self, luma: &LumaPlane) -> ScoreResult;
    fn exposure(&self, luma: &LumaPlane) -> ScoreResult;
    fn optical_flow_magnitude(&self, current: &LumaPlane, reference: &LumaPlane) -> ScoreResult;
    fn structural_similarity(&self, a: &LumaPlane, b: &LumaPlane) -> ScoreResult;
}

/// 质量信号（固定集合，按配置权重组合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityMetric {
    Sharpness,
    Noise,
    Contrast,
    Exposure,
}

impl QualityMetric {
    pub const ALL: [QualityMetric; 4] = [
        QualityMetric::Sharpness,
        QualityMetric::Noise,
        QualityMetric::Contrast,
        QualityMetric::Exposure,
    ];

    pub fn score(self, scorer: &dyn FrameScorer, luma: &LumaPlane) -> ScoreResult {
        match self {
            QualityMetric::Sharpness => scorer.sharpness(luma),
            QualityMetric::Noise => scorer.noise(luma),
            QualityMetric::Contrast => scorer.contrast(luma),
            QualityMetric::Exposure => scorer.exposure(luma),
        }
    }

    pub fn weight(self, weights: &QualityWeights) -> f32 {
        match self {
            QualityMetric::Sharpness => weights.sharpness,
            QualityMetric::Noise => weights.noise,
            QualityMetric::Contrast => weights.contrast,
            QualityMetric::Exposure => weights.exposure,
        }
    }

    /// Maps a raw signal onto "higher is better".
    pub fn goodness(self, value: f32) -> f32 {
        match self {
            QualityMetric::Noise => 1.0 - value,
            _ => value,
        }
    }
}

impl FrameMetadata {
    pub fn measure(scorer: &dyn FrameScorer, luma: &LumaPlane) -> Result<Self, ScoreError> {
        Ok(Self {
            sharpness: QualityMetric::Sharpness.score(scorer, luma)?,
            noise: QualityMetric::Noise.score(scorer, luma)?,
            contrast: QualityMetric::Contrast.score(scorer, luma)?,
            exposure: QualityMetric::Exposure.score(scorer, luma)?,
        })
    }

    pub fn get(&self, metric: QualityMetric) -> f32 {
        match metric {
            QualityMetric::Sharpness => self.sharpness,
            QualityMetric::Noise => self.noise,
            QualityMetric::Contrast => self.contrast,
            QualityMetric::Exposure => self.exposure,
        }
    }

    /// 加权质量分，范围 [0, 1]
    pub fn composite(&self, weights: &QualityWeights) -> f32 {
        let total = weights.total();
        if total <= 0.0 {
            return 0.0;
        }
        let sum: f32 = QualityMetric::ALL
            .iter()
            .map(|m| m.weight(weights) * m.goodness(self.get(*m)))
            .sum();
        (sum / total).clamp(0.0, 1.0)
    }
}

/// 默认的 CPU 评分实现
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScorer;

impl DefaultScorer {
    pub fn new() -> Self {
        Self
    }

    fn require(luma: &LumaPlane, min_side: u32) -> Result<(), ScoreError> {
        if luma.width < min_side || luma.height < min_side {
            return Err(ScoreError(format!(
                "plane {}x{} smaller than {}x{}",
                luma.width, luma.height, min_side, min_side
            )));
        }
        if luma.data.len() != (luma.width * luma.height) as usize {
            return Err(ScoreError(format!(
                "plane {}x{} has {} bytes",
                luma.width,
                luma.height,
                luma.data.len()
            )));
        }
        Ok(())
    }

    fn require_pair(a: &LumaPlane, b: &LumaPlane) -> Result<(), ScoreError> {
        Self::require(a, 1)?;
        Self::require(b, 1)?;
        if a.width != b.width || a.height != b.height {
            return Err(ScoreError(format!(
                "plane sizes differ: {}x{} vs {}x{}",
                a.width, a.height, b.width, b.height
            )));
        }
        Ok(())
    }

    fn mean_and_variance(values: impl Iterator<Item = f64>) -> (f64, f64) {
        let mut n = 0f64;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        for v in values {
            n += 1.0;
            sum += v;
            sum_sq += v * v;
        }
        if n == 0.0 {
            return (0.0, 0.0);
        }
        let mean = sum / n;
        (mean, (sum_sq / n - mean * mean).max(0.0))
    }

    fn window_ssim(a: &LumaPlane, b: &LumaPlane, x0: usize, y0: usize, ww: usize, wh: usize) -> f64 {
        let n = (ww * wh) as f64;
        let (mut sa, mut sb, mut saa, mut sbb, mut sab) = (0f64, 0f64, 0f64, 0f64, 0f64);
        for y in y0..y0 + wh {
            for x in x0..x0 + ww {
                let va = a.get(x, y) as f64;
                let vb = b.get(x, y) as f64;
                sa += va;
                sb += vb;
                saa += va * va;
                sbb += vb * vb;
                sab += va * vb;
            }
        }
        let mu_a = sa / n;
        let mu_b = sb / n;
        let var_a = (saa / n - mu_a * mu_a).max(0.0);
        let var_b = (sbb / n - mu_b * mu_b).max(0.0);
        let cov = sab / n - mu_a * mu_b;

        ((2.0 * mu_a * mu_b + SSIM_C1) * (2.0 * cov + SSIM_C2))
            / ((mu_a * mu_a + mu_b * mu_b + SSIM_C1) * (var_a + var_b + SSIM_C2))
    }

    /// Best-match SAD for one block within ±FLOW_RADIUS; returns (displacement, residual).
    fn match_block(current: &LumaPlane, reference: &LumaPlane, bx: usize, by: usize, bw: usize, bh: usize) -> (f64, f64) {
        let w = current.width as i32;
        let h = current.height as i32;
        let sad_at = |dx: i32, dy: i32| -> Option<u64> {
            let x0 = bx as i32 + dx;
            let y0 = by as i32 + dy;
            if x0 < 0 || y0 < 0 || x0 + bw as i32 > w || y0 + bh as i32 > h {
                return None;
            }
            let mut sad = 0u64;
            for y in 0..bh {
                for x in 0..bw {
                    let c = current.get(bx + x, by + y) as i32;
                    let r = reference.get(x0 as usize + x, y0 as usize + y) as i32;
                    sad += (c - r).unsigned_abs() as u64;
                }
            }
            Some(sad)
        };

        // (0, 0) is always in bounds; only strictly better matches move away from it.
        let mut best = (sad_at(0, 0).unwrap_or(0), 0i32, 0i32);
        for dy in -FLOW_RADIUS..=FLOW_RADIUS {
            for dx in -FLOW_RADIUS..=FLOW_RADIUS {
                if dx == 0 && dy == 0 {
                    continue;
                }
                if let Some(sad) = sad_at(dx, dy) {
                    if sad < best.0 {
                        best = (sad, dx, dy);
                    }
                }
            }
        }

        let displacement = ((best.1 * best.1 + best.2 * best.2) as f64).sqrt()
            / (FLOW_RADIUS as f64 * std::f64::consts::SQRT_2);
        let residual = best.0 as f64 / (bw * bh) as f64;
        (displacement, residual)
    }
}

impl FrameScorer for DefaultScorer {
    /// Variance of the 4-neighbour Laplacian.
    fn sharpness(&self, luma: &LumaPlane) -> ScoreResult {
        Self::require(luma, 3)?;
        let w = luma.width as usize;
        let h = luma.height as usize;
        let laplacians = (1..h - 1).flat_map(|y| {
            (1..w - 1).map(move |x| {
                let c = luma.get(x, y) as f64;
                luma.get(x - 1, y) as f64
                    + luma.get(x + 1, y) as f64
                    + luma.get(x, y - 1) as f64
                    + luma.get(x, y + 1) as f64
                    - 4.0 * c
            })
        });
        let (_, variance) = Self::mean_and_variance(laplacians);
        Ok((variance / (variance + SHARPNESS_SCALE)) as f32)
    }

    /// Mean absolute difference against a 3x3 box blur.
    fn noise(&self, luma: &LumaPlane) -> ScoreResult {
        Self::require(luma, 3)?;
        let w = luma.width as usize;
        let h = luma.height as usize;
        let mut total = 0f64;
        let mut count = 0f64;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut sum = 0u32;
                for ny in y - 1..=y + 1 {
                    for nx in x - 1..=x + 1 {
                        sum += luma.get(nx, ny) as u32;
                    }
                }
                let blurred = sum as f64 / 9.0;
                total += (luma.get(x, y) as f64 - blurred).abs();
                count += 1.0;
            }
        }
        let residual = if count > 0.0 { total / count } else { 0.0 };
        Ok((residual / NOISE_SCALE).min(1.0) as f32)
    }

    /// Standard deviation of intensity.
    fn contrast(&self, luma: &LumaPlane) -> ScoreResult {
        Self::require(luma, 1)?;
        let (_, variance) = Self::mean_and_variance(luma.data.iter().map(|&v| v as f64));
        Ok((variance.sqrt() / 127.5).min(1.0) as f32)
    }

    /// Histogram balance, penalised by clipped shadows and highlights.
    fn exposure(&self, luma: &LumaPlane) -> ScoreResult {
        Self::require(luma, 1)?;
        let hist = luma.histogram();
        let total: u32 = hist.iter().sum();
        let weighted: f64 = hist
            .iter()
            .enumerate()
            .map(|(bin, &n)| (bin as f64 * 4.0 + 1.5) * n as f64)
            .sum();
        let mean = weighted / total as f64;
        let balance = 1.0 - ((mean - 127.5).abs() / 127.5);
        let clipped = (hist[0] + hist[63]) as f64 / total as f64;
        Ok((balance * (1.0 - clipped)).clamp(0.0, 1.0) as f32)
    }

    /// Coarse block-matching flow: per block, the larger of the normalised
    /// displacement and the unexplained residual, averaged over blocks.
    fn optical_flow_magnitude(&self, current: &LumaPlane, reference: &LumaPlane) -> ScoreResult {
        Self::require_pair(current, reference)?;
        let w = current.width as usize;
        let h = current.height as usize;
        let bw = FLOW_BLOCK.min(w);
        let bh = FLOW_BLOCK.min(h);

        let mut total = 0f64;
        let mut blocks = 0f64;
        let mut by = 0;
        while by + bh <= h {
            let mut bx = 0;
            while bx + bw <= w {
                let (displacement, residual) = Self::match_block(current, reference, bx, by, bw, bh);
                total += displacement.max((residual / RESIDUAL_SCALE).min(1.0));
                blocks += 1.0;
                bx += bw;
            }
            by += bh;
        }
        Ok((total / blocks).clamp(0.0, 1.0) as f32)
    }

    /// Mean SSIM over non-overlapping 8x8 windows, clamped to [0, 1].
    fn structural_similarity(&self, a: &LumaPlane, b: &LumaPlane) -> ScoreResult {
        Self::require_pair(a, b)?;
        let w = a.width as usize;
        let h = a.height as usize;
        let ww = SSIM_WINDOW.min(w);
        let wh = SSIM_WINDOW.min(h);

        let mut total = 0f64;
        let mut windows = 0f64;
        let mut y = 0;
        while y + wh <= h {
            let mut x = 0;
            while x + ww <= w {
                total += Self::window_ssim(a, b, x, y, ww, wh);
                windows += 1.0;
                x += ww;
            }
            y += wh;
        }
        Ok((total / windows).clamp(0.0, 1.0) as f32)
    }
}
