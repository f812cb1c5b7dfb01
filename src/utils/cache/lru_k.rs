use std::collections::{HashMap, VecDeque};

use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{PlumeError, PlumeResult};

#[derive(Debug)]
struct LRUKNode {
    k: usize,
    // Timestamps of the last k accesses, oldest first.
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LRUKNode {
    fn new(k: usize) -> Self {
        Self {
            k,
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64) {
        self.history.push_back(timestamp);
        if self.history.len() > self.k {
            self.history.pop_front();
        }
    }
}

/// Evicts the evictable frame with the largest backward k-distance. Frames
/// with fewer than k recorded accesses count as infinite distance and are
/// ordered among themselves by oldest access.
#[derive(Debug)]
pub struct LRUKReplacer {
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LRUKNode>,
    current_timestamp: u64,
}

impl LRUKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }
}

impl Replacer for LRUKReplacer {
    fn new(capacity: usize) -> Self {
        const DEFAULT_K: usize = 2;
        Self::with_k(capacity, DEFAULT_K)
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut max_k_distance = 0;
        let mut result = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            let k_distance = if node.history.len() < self.k {
                u64::MAX - node.history.front().copied().unwrap_or(0)
            } else {
                self.current_timestamp - node.history.front().copied().unwrap_or(0)
            };
            if k_distance > max_k_distance {
                max_k_distance = k_distance;
                result = Some(*frame_id);
            }
        }
        if let Some(frame_id) = result {
            self.remove(frame_id);
        }
        result
    }

    fn record_access(&mut self, frame_id: FrameId) -> PlumeResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.record_access(self.current_timestamp);
            self.current_timestamp += 1;
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(PlumeError::Internal(
                    "frame count exceeds replacer capacity".to_string(),
                ));
            }
            let mut node = LRUKNode::new(self.k);
            node.record_access(self.current_timestamp);
            self.current_timestamp += 1;
            self.node_store.insert(frame_id, node);
        }
        Ok(())
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> PlumeResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            let evictable = node.is_evictable;
            node.is_evictable = set_evictable;
            if set_evictable && !evictable {
                self.current_size += 1;
            } else if !set_evictable && evictable {
                self.current_size -= 1;
            }
            Ok(())
        } else {
            Err(PlumeError::Internal("frame not found".to_string()))
        }
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            assert!(node.is_evictable, "frame is not evictable");
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}
