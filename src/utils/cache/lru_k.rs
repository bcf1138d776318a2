use super::Replacer;
use crate::buffer::FrameId;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct LRUKNode {
    // up to k most recent access timestamps, oldest first
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LRUKNode {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }
}

#[derive(Debug)]
pub struct LRUKReplacer {
    // number of evictable frames
    current_size: usize,
    // upper bound on tracked frames
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LRUKNode>,
    current_timestamp: u64,
}

impl LRUKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k > 0");
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }

    /// Whether `a` is a better eviction victim than `b`: a frame with fewer
    /// than k samples (infinite backward distance) always beats a frame
    /// with a full history; among equals the older oldest-tracked access
    /// wins, which for full histories is the larger K-distance and for
    /// short histories is plain LRU on the first recorded access.
    fn better_victim(&self, a: &LRUKNode, b: &LRUKNode) -> bool {
        if a.history.len() < self.k && b.history.len() == self.k {
            return true;
        }
        if a.history.len() == self.k && b.history.len() < self.k {
            return false;
        }
        a.history.front() < b.history.front()
    }
}

impl Replacer for LRUKReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        if !self.node_store.contains_key(&frame_id) && self.node_store.len() >= self.replacer_size
        {
            // tracker is full; the access is dropped
            return;
        }
        let node = self.node_store.entry(frame_id).or_insert_with(LRUKNode::new);
        if node.history.len() == self.k {
            node.history.pop_front();
        }
        node.history.push_back(self.current_timestamp);
        self.current_timestamp += 1;
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<FrameId> = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            match victim {
                None => victim = Some(*frame_id),
                Some(best) => {
                    if self.better_victim(node, &self.node_store[&best]) {
                        victim = Some(*frame_id);
                    }
                }
            }
        }
        if let Some(frame_id) = victim {
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
        victim
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            if evictable && !node.is_evictable {
                self.current_size += 1;
            } else if !evictable && node.is_evictable {
                self.current_size -= 1;
            }
            node.is_evictable = evictable;
        }
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            assert!(node.is_evictable, "remove() on a non-evictable frame");
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_evictable_tracks_size() {
        let mut replacer = LRUKReplacer::new(3, 2);
        replacer.record_access(1);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false);
        assert_eq!(replacer.size(), 0);
        // unknown frames are ignored
        replacer.set_evictable(99, true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn evict_prefers_largest_k_distance() {
        let mut replacer = LRUKReplacer::new(2, 3);
        replacer.record_access(1); // ts=0
        replacer.record_access(2); // ts=1
        replacer.record_access(2); // ts=2
        replacer.record_access(1); // ts=3
        replacer.record_access(2); // ts=4
        replacer.record_access(1); // ts=5
        replacer.record_access(2); // ts=6
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        // frame 1 history [0,3,5], frame 2 history [2,4,6]; frame 1's third
        // most recent access is older
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn infinite_distance_beats_full_history() {
        // k=2, capacity 3; access 1,2,3,1,2 and evict
        let mut replacer = LRUKReplacer::new(3, 2);
        replacer.record_access(1); // ts=0
        replacer.record_access(2); // ts=1
        replacer.record_access(3); // ts=2
        replacer.record_access(1); // ts=3
        replacer.record_access(2); // ts=4
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        replacer.set_evictable(3, true);
        // frame 3 is the only one with fewer than 2 samples
        assert_eq!(replacer.evict(), Some(3));
        // among full histories, frame 1's oldest access (0) beats frame 2's (1)
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn infinite_distance_ties_break_by_first_access() {
        let mut replacer = LRUKReplacer::new(3, 3);
        replacer.record_access(1); // ts=0
        replacer.record_access(2); // ts=1
        replacer.record_access(3); // ts=2
        replacer.record_access(1); // ts=3
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        replacer.set_evictable(3, true);
        // all have <3 samples; earliest first-recorded access wins
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
    }

    #[test]
    fn full_tracker_drops_new_accesses() {
        let mut replacer = LRUKReplacer::new(2, 2);
        replacer.record_access(1);
        replacer.record_access(2);
        // 3 is not tracked: the replacer is at capacity
        replacer.record_access(3);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.size(), 0);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        assert_eq!(replacer.evict(), Some(1));
        // eviction frees a slot
        replacer.record_access(3);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn eviction_forgets_history() {
        let mut replacer = LRUKReplacer::new(2, 2);
        replacer.record_access(1); // ts=0
        replacer.record_access(1); // ts=1
        replacer.set_evictable(1, true);
        assert_eq!(replacer.evict(), Some(1));
        // frame 1 comes back with a fresh, short history
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(2);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn remove_evictable_frame() {
        let mut replacer = LRUKReplacer::new(2, 2);
        replacer.record_access(1);
        replacer.set_evictable(1, true);
        replacer.remove(1);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
        // removing an unknown frame is a no-op
        replacer.remove(1);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn remove_pinned_frame_panics() {
        let mut replacer = LRUKReplacer::new(2, 2);
        replacer.record_access(1);
        replacer.remove(1);
    }
}
