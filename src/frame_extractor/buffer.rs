//! 有界帧缓冲 - 解码线程与分析线程之间的生产者/消费者队列
//!
//! 同时限制槽位数与字节数。准入检查与预留在同一把锁内完成；
//! 预留以 [`SlotLease`] 的形式随帧流转，直到选择器做出决定后释放。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use log::debug;

use crate::core::error::KeyframeError;
use crate::core::video::Frame;

/// A frame that was not admitted, handed back to the producer.
#[derive(Debug)]
pub struct Rejected {
    pub error: KeyframeError,
    pub frame: Frame,
}

/// 已准入的帧，seq 为连续的准入序号
#[derive(Debug)]
pub struct BufferedFrame {
    pub seq: u64,
    pub frame: Frame,
    pub lease: SlotLease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub queued: usize,
    pub occupied_slots: usize,
    pub bytes_in_use: usize,
    pub peak_slots: usize,
    pub peak_bytes: usize,
    pub admitted: u64,
}

#[derive(Debug, Default)]
struct Occupancy {
    queue: VecDeque<BufferedFrame>,
    slots: usize,
    next_seq: u64,
    peak_slots: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<Occupancy>,
    not_full: Condvar,
    not_empty: Condvar,
    /// Only written while `state` is held; readable without the lock.
    bytes_in_use: AtomicUsize,
    peak_bytes: AtomicUsize,
    max_slots: usize,
    max_bytes: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Occupancy> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, state: &Occupancy, bytes: usize) -> bool {
        state.slots < self.max_slots
            && self.bytes_in_use.load(Ordering::Acquire) + bytes <= self.max_bytes
    }

    fn release(&self, bytes: usize) {
        let mut state = self.lock();
        state.slots = state.slots.saturating_sub(1);
        let current = self.bytes_in_use.load(Ordering::Acquire);
        self.bytes_in_use
            .store(current.saturating_sub(bytes), Ordering::Release);
        drop(state);
        self.not_full.notify_all();
    }
}

/// 缓冲槽位预留；drop 时归还字节与槽位
///
/// Holds a weak handle: queued frames live inside the buffer itself.
#[derive(Debug)]
pub struct SlotLease {
    shared: Weak<Shared>,
    bytes: usize,
}

impl SlotLease {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(self.bytes);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameBuffer {
    shared: Arc<Shared>,
}

impl FrameBuffer {
    pub fn new(max_slots: usize, max_bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Occupancy::default()),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                bytes_in_use: AtomicUsize::new(0),
                peak_bytes: AtomicUsize::new(0),
                max_slots: max_slots.max(1),
                max_bytes,
            }),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.shared.max_slots
    }

    pub fn max_bytes(&self) -> usize {
        self.shared.max_bytes
    }

    /// 非阻塞准入；容量不足时返回 `Full`
    pub fn try_enqueue(&self, frame: Frame) -> Result<u64, Rejected> {
        self.admit(frame, None)
    }

    /// Blocks until capacity frees, failing with `Timeout` once `timeout` elapses.
    pub fn enqueue_timeout(&self, frame: Frame, timeout: Duration) -> Result<u64, Rejected> {
        self.admit(frame, Some(timeout))
    }

    fn admit(&self, frame: Frame, timeout: Option<Duration>) -> Result<u64, Rejected> {
        let shared = &self.shared;
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let bytes = frame.byte_size();
        if bytes > shared.max_bytes {
            return Err(Rejected {
                error: KeyframeError::FrameTooLarge {
                    index: frame.index,
                    bytes,
                    budget: shared.max_bytes,
                },
                frame,
            });
        }

        let mut state = shared.lock();
        loop {
            if state.closed {
                return Err(Rejected {
                    error: KeyframeError::Closed,
                    frame,
                });
            }
            if shared.fits(&state, bytes) {
                break;
            }
            let Some((deadline, timeout)) = deadline else {
                return Err(Rejected {
                    error: KeyframeError::Full,
                    frame,
                });
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(Rejected {
                    error: KeyframeError::Timeout(timeout),
                    frame,
                });
            }
            state = shared
                .not_full
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        // 检查与预留在同一临界区内完成
        state.slots += 1;
        state.peak_slots = state.peak_slots.max(state.slots);
        let in_use = shared.bytes_in_use.load(Ordering::Acquire) + bytes;
        shared.bytes_in_use.store(in_use, Ordering::Release);
        shared.peak_bytes.fetch_max(in_use, Ordering::AcqRel);

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(BufferedFrame {
            seq,
            frame,
            lease: SlotLease {
                shared: Arc::downgrade(shared),
                bytes,
            },
        });
        drop(state);
        shared.not_empty.notify_one();
        Ok(seq)
    }

    /// 非阻塞出队；`Closed` 表示已关闭且排空
    pub fn dequeue(&self) -> Result<BufferedFrame, KeyframeError> {
        let mut state = self.shared.lock();
        match state.queue.pop_front() {
            Some(frame) => Ok(frame),
            None if state.closed => Err(KeyframeError::Closed),
            None => Err(KeyframeError::Empty),
        }
    }

    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<BufferedFrame, KeyframeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(frame) = state.queue.pop_front() {
                return Ok(frame);
            }
            if state.closed {
                return Err(KeyframeError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(KeyframeError::Timeout(timeout));
            }
            state = self
                .shared
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stops admission. Queued frames can still be dequeued.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            debug!("📪 Frame buffer closed with {} queued", state.queue.len());
        }
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn is_drained(&self) -> bool {
        let state = self.shared.lock();
        state.closed && state.queue.is_empty()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.shared.bytes_in_use.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.shared.lock();
        BufferStats {
            queued: state.queue.len(),
            occupied_slots: state.slots,
            bytes_in_use: self.shared.bytes_in_use.load(Ordering::Acquire),
            peak_slots: state.peak_slots,
            peak_bytes: self.shared.peak_bytes.load(Ordering::Acquire),
            admitted: state.next_seq,
        }
    }
}
