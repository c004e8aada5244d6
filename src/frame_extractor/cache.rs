//! 关键帧缓存窗口 - 最近 W 个保留帧，供多帧相似度比较

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::core::video::{Frame, FrameMetadata, LumaPlane};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub frame: Arc<Frame>,
    pub metadata: FrameMetadata,
    /// Comparison-resolution luma used for motion and similarity.
    pub signature: Arc<LumaPlane>,
    pub quality: f32,
}

impl CacheEntry {
    pub fn index(&self) -> u64 {
        self.frame.index
    }
}

#[derive(Debug)]
struct CacheState {
    entries: VecDeque<CacheEntry>,
    pinned: Option<u64>,
}

/// 固定容量、按时间排序的缓存；单锁串行化所有修改
#[derive(Debug)]
pub struct FrameCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(CacheState {
                entries: VecDeque::with_capacity(capacity + 1),
                pinned: None,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts as most recent. When over capacity the oldest unpinned entry
    /// is evicted and returned.
    pub fn offer(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let mut state = self.lock();
        state.entries.push_back(entry);
        self.evict(&mut state)
    }

    /// Inserts and pins in one step, so the new keyframe is never the
    /// eviction victim.
    pub fn offer_pinned(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let mut state = self.lock();
        state.pinned = Some(entry.index());
        state.entries.push_back(entry);
        self.evict(&mut state)
    }

    fn evict(&self, state: &mut CacheState) -> Option<CacheEntry> {
        if state.entries.len() <= self.capacity {
            return None;
        }

        let pinned = state.pinned;
        let victim = state
            .entries
            .iter()
            .position(|e| Some(e.index()) != pinned)?;
        let evicted = state.entries.remove(victim);
        if let Some(e) = &evicted {
            debug!("🧹 Cache evicted frame {}", e.index());
        }
        evicted
    }

    /// 将指定帧标记为当前参考关键帧，取代之前的标记
    pub fn pin(&self, index: u64) -> bool {
        let mut state = self.lock();
        if state.entries.iter().any(|e| e.index() == index) {
            state.pinned = Some(index);
            true
        } else {
            false
        }
    }

    pub fn pinned(&self) -> Option<CacheEntry> {
        let state = self.lock();
        let pinned = state.pinned?;
        state.entries.iter().find(|e| e.index() == pinned).cloned()
    }

    pub fn remove(&self, index: u64) -> Option<CacheEntry> {
        let mut state = self.lock();
        let position = state.entries.iter().position(|e| e.index() == index)?;
        if state.pinned == Some(index) {
            state.pinned = None;
        }
        state.entries.remove(position)
    }

    /// 当前窗口，最旧的在前
    pub fn window(&self) -> Vec<CacheEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<CacheEntry> {
        self.lock().entries.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.pinned = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_entry(index: u64) -> CacheEntry {
        CacheEntry {
            frame: Arc::new(Frame::new(2, 2, vec![index as u8; 16], index * 40, index)),
            metadata: FrameMetadata {
                sharpness: 0.5,
                noise: 0.1,
                contrast: 0.5,
                exposure: 0.5,
            },
            signature: Arc::new(LumaPlane::new(2, 2, vec![index as u8; 4])),
            quality: 0.6,
        }
    }

    fn indices(cache: &FrameCache) -> Vec<u64> {
        cache.window().iter().map(|e| e.index()).collect()
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = FrameCache::new(3);
        for i in 0..3 {
            assert!(cache.offer(create_test_entry(i)).is_none());
        }
        let evicted = cache.offer(create_test_entry(3)).unwrap();
        assert_eq!(evicted.index(), 0);
        assert_eq!(indices(&cache), vec![1, 2, 3]);
        assert_eq!(cache.latest().unwrap().index(), 3);
    }

    #[test]
    fn test_pinned_entry_survives_eviction() {
        let cache = FrameCache::new(3);
        cache.offer(create_test_entry(0));
        assert!(cache.pin(0));

        for i in 1..6 {
            cache.offer(create_test_entry(i));
            assert!(cache.len() <= 3);
        }
        assert_eq!(indices(&cache), vec![0, 4, 5]);
        assert_eq!(cache.pinned().unwrap().index(), 0);
    }

    #[test]
    fn test_new_pin_supersedes_old() {
        let cache = FrameCache::new(2);
        cache.offer(create_test_entry(0));
        cache.pin(0);
        cache.offer(create_test_entry(1));
        cache.pin(1);

        // 旧的参考帧重新参与 FIFO 淘汰
        let evicted = cache.offer(create_test_entry(2)).unwrap();
        assert_eq!(evicted.index(), 0);
        assert_eq!(indices(&cache), vec![1, 2]);
    }

    #[test]
    fn test_offer_pinned_with_single_slot() {
        let cache = FrameCache::new(1);
        cache.offer_pinned(create_test_entry(0));
        let evicted = cache.offer_pinned(create_test_entry(1)).unwrap();
        assert_eq!(evicted.index(), 0);
        assert_eq!(cache.pinned().unwrap().index(), 1);
        assert_eq!(indices(&cache), vec![1]);
    }

    #[test]
    fn test_pin_unknown_and_remove() {
        let cache = FrameCache::new(2);
        assert!(!cache.pin(7));
        cache.offer(create_test_entry(7));
        cache.pin(7);
        assert_eq!(cache.remove(7).unwrap().index(), 7);
        assert!(cache.pinned().is_none());
        assert!(cache.is_empty());
    }
}
