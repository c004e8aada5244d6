//! 测试用合成视频

use crate::core::video::{Frame, MemorySource};

pub const TEST_FPS: f32 = 25.0;

fn timestamp_ms(index: u64) -> u64 {
    index * 1000 / TEST_FPS as u64
}

pub fn uniform_frame(width: u32, height: u32, value: u8, index: u64) -> Frame {
    let data = (0..width * height)
        .flat_map(|_| [value, value, value, 255])
        .collect();
    Frame::new(width, height, data, timestamp_ms(index), index)
}

/// Gray hash noise; the same seed always yields the same pixels.
pub fn noise_frame(width: u32, height: u32, seed: u32, index: u64) -> Frame {
    let data = (0..width * height)
        .flat_map(|i| {
            let mut v = i
                .wrapping_mul(2654435761)
                .wrapping_add(seed.wrapping_mul(40503).wrapping_add(1));
            v ^= v >> 13;
            v = v.wrapping_mul(1274126177);
            v ^= v >> 16;
            let g = (v >> 8) as u8;
            [g, g, g, 255]
        })
        .collect();
    Frame::new(width, height, data, timestamp_ms(index), index)
}

/// 每 `step` 帧切换一次画面内容
pub fn step_video(frame_count: u64, step: u64, size: u32) -> Vec<Frame> {
    (0..frame_count)
        .map(|i| noise_frame(size, size, (i / step) as u32 + 1, i))
        .collect()
}

pub fn step_source(frame_count: u64, step: u64, size: u32) -> MemorySource {
    MemorySource::new(TEST_FPS, step_video(frame_count, step, size))
}
