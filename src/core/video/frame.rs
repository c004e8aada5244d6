use std::time::Duration;

use serde::Serialize;

use crate::core::error::{KeyframeError, Result};

/// 视频流元数据（打开时创建，之后只读）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub frame_count: Option<u64>,
    pub fps: f32,
    pub width: u32,
    pub height: u32,
    pub codec: String,
}

/// 帧数据结构
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    pub timestamp: Duration,
    pub index: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_ms: u64, index: u64) -> Self {
        Self {
            width,
            height,
            data,
            timestamp: Duration::from_millis(timestamp_ms),
            index,
        }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    /// Bytes charged against the frame buffer's memory budget.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp.as_millis() as u64
    }

    /// Rejects frames the scoring kernels cannot read.
    pub fn check_layout(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(KeyframeError::analysis(self.index, "zero-sized frame"));
        }
        if self.data.len() != self.pixel_count() * 4 {
            return Err(KeyframeError::analysis(
                self.index,
                format!(
                    "expected {} RGBA bytes for {}x{}, got {}",
                    self.pixel_count() * 4,
                    self.width,
                    self.height,
                    self.data.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.pixel_count() * 3);
        for chunk in self.data.chunks_exact(4) {
            rgb.push(chunk[0]); // R
            rgb.push(chunk[1]); // G
            rgb.push(chunk[2]); // B
        }
        rgb
    }

    /// 转为亮度平面（BT.601 整数系数）
    pub fn to_luma(&self) -> Result<LumaPlane> {
        self.check_layout()?;
        let data = self
            .data
            .chunks_exact(4)
            .map(|rgba| {
                ((rgba[0] as u32 * 299 + rgba[1] as u32 * 587 + rgba[2] as u32 * 114) / 1000) as u8
            })
            .collect();
        Ok(LumaPlane {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

/// 帧质量信号（分析时计算一次，之后不可变）
///
/// `noise` is a level (higher is noisier); the other three are already
/// "higher is better".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameMetadata {
    pub sharpness: f32,
    pub noise: f32,
    pub contrast: f32,
    pub exposure: f32,
}

/// 8-bit luma plane, the input of every scoring kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct LumaPlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl LumaPlane {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width as usize + x]
    }

    /// 块平均下采样到 target_w x target_h
    pub fn downsample(&self, target_w: u32, target_h: u32) -> LumaPlane {
        let w = self.width as usize;
        let h = self.height as usize;
        let tw = target_w.max(1) as usize;
        let th = target_h.max(1) as usize;

        let mut result = Vec::with_capacity(tw * th);

        for by in 0..th {
            let y_start = by * h / th;
            let y_end = ((by + 1) * h / th).max(y_start + 1).min(h);
            for bx in 0..tw {
                let x_start = bx * w / tw;
                let x_end = ((bx + 1) * w / tw).max(x_start + 1).min(w);

                let mut block_sum = 0u32;
                let mut count = 0u32;
                for py in y_start..y_end {
                    let row_offset = py * w;
                    for px in x_start..x_end {
                        if let Some(&val) = self.data.get(row_offset + px) {
                            block_sum += val as u32;
                            count += 1;
                        }
                    }
                }

                result.push(if count > 0 { (block_sum / count) as u8 } else { 0 });
            }
        }

        LumaPlane::new(tw as u32, th as u32, result)
    }

    /// Resizes to `target_width`, keeping the aspect ratio. Planes already
    /// narrower than the target are returned as-is.
    pub fn fit_width(&self, target_width: u32) -> LumaPlane {
        if self.width <= target_width {
            return self.clone();
        }
        let target_height =
            ((self.height as u64 * target_width as u64) / self.width as u64).max(1) as u32;
        match image::GrayImage::from_raw(self.width, self.height, self.data.clone()) {
            Some(img) => {
                let resized = image::imageops::resize(
                    &img,
                    target_width,
                    target_height,
                    image::imageops::FilterType::Triangle,
                );
                LumaPlane::new(target_width, target_height, resized.into_raw())
            }
            None => self.downsample(target_width, target_height),
        }
    }

    /// 64 档亮度直方图
    pub fn histogram(&self) -> [u32; 64] {
        let mut hist = [0u32; 64];
        for &val in &self.data {
            hist[(val >> 2) as usize] += 1;
        }
        hist
    }
}

/// 从原生层传递的原始帧数据（I420）
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub timestamp_ms: u64,
    pub index: u64,
}

impl RawFrame {
    /// I420 转 RGBA；色度平面按 2x2 共享
    pub fn to_rgba(&self) -> Frame {
        let width = self.width as usize;
        let chroma_width = width.div_ceil(2);
        let mut rgba = Vec::with_capacity(self.y_plane.len() * 4);

        for (row, luma_row) in self.y_plane.chunks_exact(width.max(1)).enumerate() {
            let chroma_row = (row / 2) * chroma_width;
            for (col, &luma) in luma_row.iter().enumerate() {
                let at = chroma_row + col / 2;
                let u = self.u_plane.get(at).copied().unwrap_or(128);
                let v = self.v_plane.get(at).copied().unwrap_or(128);
                rgba.extend_from_slice(&yuv_to_rgba(luma, u, v));
            }
        }

        Frame::new(self.width, self.height, rgba, self.timestamp_ms, self.index)
    }
}

/// BT.601 全范围，系数放大 2^16 做定点运算
fn yuv_to_rgba(y: u8, u: u8, v: u8) -> [u8; 4] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    let r = y + ((91_881 * v) >> 16);
    let g = y - ((22_554 * u + 46_802 * v) >> 16);
    let b = y + ((116_130 * u) >> 16);
    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
        255,
    ]
}
