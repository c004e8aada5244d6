//! 关键帧写出 - PNG / JPEG / WebP

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError};
use log::debug;

use super::frame::Frame;
use crate::core::config::OutputFormat;
use crate::core::error::{KeyframeError, Result};

pub trait FrameWriter: Send + Sync {
    /// Writes `frame` into the `destination` directory and returns the file path.
    fn write(
        &self,
        frame: &Frame,
        destination: &Path,
        format: OutputFormat,
        quality: u8,
    ) -> Result<PathBuf>;
}

/// 文件名：frame_000042.png
pub fn output_file_name(index: u64, format: OutputFormat) -> String {
    format!("frame_{:06}.{}", index, format.extension())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileWriter;

impl ImageFileWriter {
    pub fn new() -> Self {
        Self
    }

    /// PNG 压缩等级 0-9 映射到编码器的三档
    fn png_compression(level: u8) -> CompressionType {
        match level {
            0..=2 => CompressionType::Fast,
            3..=6 => CompressionType::Default,
            _ => CompressionType::Best,
        }
    }

    fn encode<W: Write>(out: W, frame: &Frame, format: OutputFormat, quality: u8) -> Result<()> {
        let encoded = match format {
            OutputFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    out,
                    Self::png_compression(quality),
                    FilterType::Adaptive,
                );
                encoder.write_image(&frame.data, frame.width, frame.height, ExtendedColorType::Rgba8)
            }
            OutputFormat::Jpeg => {
                // JPEG 不支持 alpha
                let rgb = frame.to_rgb();
                let encoder = JpegEncoder::new_with_quality(out, quality.clamp(1, 100));
                encoder.write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            }
            OutputFormat::WebP => {
                // Only the lossless encoder is available; quality has no effect.
                let encoder = WebPEncoder::new_lossless(out);
                encoder.write_image(&frame.data, frame.width, frame.height, ExtendedColorType::Rgba8)
            }
        };
        encoded.map_err(|e| match e {
            ImageError::IoError(io) => KeyframeError::Io(io),
            other => KeyframeError::Image(other),
        })
    }
}

impl FrameWriter for ImageFileWriter {
    fn write(
        &self,
        frame: &Frame,
        destination: &Path,
        format: OutputFormat,
        quality: u8,
    ) -> Result<PathBuf> {
        frame.check_layout()?;
        std::fs::create_dir_all(destination)?;

        let path = destination.join(output_file_name(frame.index, format));
        let mut out = BufWriter::new(File::create(&path)?);
        Self::encode(&mut out, frame, format, quality)?;
        out.flush()?;

        debug!("💾 Wrote frame {} to {}", frame.index, path.display());
        Ok(path)
    }
}
