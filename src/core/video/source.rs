//! 帧源适配器 - 把外部解码结果包装成有限、惰性、不可重启的帧序列

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use regex::Regex;

use super::frame::{Frame, RawFrame, VideoMetadata};
use crate::core::config::{ExtractorConfig, RawVideoConfig};
use crate::core::error::{KeyframeError, Result};

/// Default frame rate assumed for image sequences.
const SEQUENCE_FPS: f32 = 25.0;

/// 帧源：失败的读取不推进位置，重试会重读同一帧
pub trait FrameSource: Send {
    fn metadata(&self) -> &VideoMetadata;

    /// `Ok(None)` marks the end of the stream. An `Err` leaves the stream
    /// positioned on the same frame.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Moves past the frame the last read failed on and returns its index,
    /// or `None` at the end of the stream.
    fn skip_frame(&mut self) -> Option<u64>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn metadata(&self) -> &VideoMetadata {
        (**self).metadata()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn skip_frame(&mut self) -> Option<u64> {
        (**self).skip_frame()
    }
}

/// Opens `path` with the adapter that matches it: a directory is read as an
/// image sequence, `.yuv`/`.i420` files as raw I420 using `config.raw_video`.
pub fn open_source(path: &Path, config: &ExtractorConfig) -> Result<Box<dyn FrameSource>> {
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path, SEQUENCE_FPS)?));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "yuv" | "i420" => {
            let raw = config.raw_video.ok_or_else(|| {
                KeyframeError::UnsupportedFormat(format!(
                    "{} is headerless; raw_video geometry is required",
                    path.display()
                ))
            })?;
            Ok(Box::new(RawYuvSource::open(path, raw)?))
        }
        other => Err(KeyframeError::UnsupportedFormat(format!(
            "{} (extension '{}')",
            path.display(),
            other
        ))),
    }
}

/// 由宿主解码器直接交付的帧
pub struct MemorySource {
    metadata: VideoMetadata,
    frames: VecDeque<Frame>,
}

impl MemorySource {
    pub fn new(fps: f32, frames: Vec<Frame>) -> Self {
        let (width, height) = frames.first().map(|f| (f.width, f.height)).unwrap_or((0, 0));
        Self {
            metadata: VideoMetadata {
                frame_count: Some(frames.len() as u64),
                fps,
                width,
                height,
                codec: "rgba".to_string(),
            },
            frames: frames.into(),
        }
    }
}

impl FrameSource for MemorySource {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }

    fn skip_frame(&mut self) -> Option<u64> {
        self.frames.pop_front().map(|f| f.index)
    }
}

/// Headerless planar I420 stream, e.g. `ffmpeg -f rawvideo -pix_fmt yuv420p`.
pub struct RawYuvSource {
    metadata: VideoMetadata,
    reader: BufReader<File>,
    next_index: u64,
}

impl RawYuvSource {
    pub fn open(path: &Path, raw: RawVideoConfig) -> Result<Self> {
        if raw.width == 0 || raw.height == 0 || raw.width % 2 != 0 || raw.height % 2 != 0 {
            return Err(KeyframeError::UnsupportedFormat(format!(
                "I420 needs even, non-zero geometry, got {}x{}",
                raw.width, raw.height
            )));
        }
        let file = File::open(path)?;
        let frame_bytes = Self::frame_bytes(raw.width, raw.height) as u64;
        let file_len = file.metadata()?.len();
        if file_len % frame_bytes != 0 {
            warn!(
                "⚠️ {} is not a whole number of {}x{} frames; the tail will be dropped",
                path.display(),
                raw.width,
                raw.height
            );
        }

        info!(
            "🎬 Opened raw I420 {} ({}x{} @ {} fps, {} frames)",
            path.display(),
            raw.width,
            raw.height,
            raw.fps,
            file_len / frame_bytes
        );

        Ok(Self {
            metadata: VideoMetadata {
                frame_count: Some(file_len / frame_bytes),
                fps: raw.fps,
                width: raw.width,
                height: raw.height,
                codec: "I420".to_string(),
            },
            reader: BufReader::new(file),
            next_index: 0,
        })
    }

    fn frame_bytes(width: u32, height: u32) -> usize {
        (width * height) as usize * 3 / 2
    }

    /// 每次从帧边界重新定位，读取中途出错后重试不会错位
    fn read_frame(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        let frame_len = Self::frame_bytes(self.metadata.width, self.metadata.height);
        self.reader
            .seek(SeekFrom::Start(index * frame_len as u64))?;

        let mut buf = vec![0u8; frame_len];
        let mut filled = 0;
        while filled < frame_len {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == frame_len {
            return Ok(Some(buf));
        }
        if filled > 0 {
            warn!(
                "⚠️ Truncated I420 frame {} ({} of {} bytes), ending stream",
                index, filled, frame_len
            );
        }
        Ok(None)
    }
}

impl FrameSource for RawYuvSource {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let index = self.next_index;
        let Some(mut planes) = self.read_frame(index)? else {
            return Ok(None);
        };
        self.next_index += 1;

        let luma_len = (self.metadata.width * self.metadata.height) as usize;
        let v_plane = planes.split_off(luma_len + luma_len / 4);
        let u_plane = planes.split_off(luma_len);
        let raw = RawFrame {
            width: self.metadata.width,
            height: self.metadata.height,
            y_plane: planes,
            u_plane,
            v_plane,
            timestamp_ms: (index as f64 * 1000.0 / self.metadata.fps as f64) as u64,
            index,
        };
        Ok(Some(raw.to_rgba()))
    }

    fn skip_frame(&mut self) -> Option<u64> {
        let index = self.next_index;
        if self.metadata.frame_count.is_some_and(|n| index >= n) {
            return None;
        }
        self.next_index += 1;
        Some(index)
    }
}

/// 编号图片序列（frame_0001.png ...），按文件名中的编号排序
pub struct ImageSequenceSource {
    metadata: VideoMetadata,
    paths: VecDeque<PathBuf>,
    next_index: u64,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: f32) -> Result<Self> {
        let number = Regex::new(r"(\d+)\D*$").map_err(|e| KeyframeError::Config(e.to_string()))?;

        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || image::ImageFormat::from_path(&path).is_err() {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let order = number
                .captures(&stem)
                .and_then(|c| c[1].parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            entries.push((order, path));
        }

        if entries.is_empty() {
            return Err(KeyframeError::UnsupportedFormat(format!(
                "{} contains no readable images",
                dir.display()
            )));
        }
        entries.sort();

        let (width, height) = image::image_dimensions(&entries[0].1)?;
        debug!("🖼️ Image sequence {}: {} files", dir.display(), entries.len());

        Ok(Self {
            metadata: VideoMetadata {
                frame_count: Some(entries.len() as u64),
                fps,
                width,
                height,
                codec: "image-sequence".to_string(),
            },
            paths: entries.into_iter().map(|(_, p)| p).collect(),
            next_index: 0,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.front() else {
            return Ok(None);
        };
        let index = self.next_index;

        // IO 错误可重试；内容损坏只影响这一帧
        let img = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(io) => KeyframeError::Io(io),
            other => KeyframeError::analysis(index, format!("{}: {}", path.display(), other)),
        })?;
        self.paths.pop_front();
        self.next_index += 1;

        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Some(Frame::new(
            width,
            height,
            rgba.into_raw(),
            (index as f64 * 1000.0 / self.metadata.fps as f64) as u64,
            index,
        )))
    }

    fn skip_frame(&mut self) -> Option<u64> {
        let path = self.paths.pop_front()?;
        debug!("⏭️ Skipping {}", path.display());
        let index = self.next_index;
        self.next_index += 1;
        Some(index)
    }
}
