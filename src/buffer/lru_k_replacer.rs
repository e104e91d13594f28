use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::common::{FrameId, Timestamp};

/// Access history for a single tracked frame
#[derive(Debug)]
struct FrameAccessInfo {
    /// Access timestamps, oldest at the front, at most k entries
    history: VecDeque<Timestamp>,
    is_evictable: bool,
}

impl FrameAccessInfo {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Backward k-distance at `now`; `None` means fewer than k accesses (+inf)
    fn k_distance(&self, now: Timestamp, k: usize) -> Option<Timestamp> {
        if self.history.len() < k {
            None
        } else {
            Some(now - self.history[self.history.len() - k])
        }
    }

    fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.history.front().copied()
    }
}

struct ReplacerInner {
    current_timestamp: Timestamp,
    frame_info: HashMap<FrameId, FrameAccessInfo>,
    num_evictable: usize,
}

/// LRU-K replacement policy.
///
/// Evicts the frame whose backward k-distance is the maximum over all
/// evictable frames, where the k-distance is the difference between the
/// current timestamp and the timestamp of the kth previous access. A frame
/// with fewer than k recorded accesses has +inf k-distance; among several
/// +inf frames the one with the earliest recorded access is chosen.
pub struct LruKReplacer {
    k: usize,
    /// Frames with id >= max_frames are ignored
    max_frames: usize,
    inner: Mutex<ReplacerInner>,
}

impl LruKReplacer {
    pub fn new(k: usize, max_frames: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            max_frames,
            inner: Mutex::new(ReplacerInner {
                current_timestamp: 0,
                frame_info: HashMap::new(),
                num_evictable: 0,
            }),
        }
    }

    /// Selects, removes, and returns the victim frame, or `None` when no
    /// frame is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.num_evictable == 0 {
            return None;
        }

        let now = inner.current_timestamp;

        let mut victim: Option<FrameId> = None;
        let mut victim_k_dist: Option<Timestamp> = None;
        let mut victim_earliest: Option<Timestamp> = None;

        for (frame_id, info) in inner.frame_info.iter() {
            if !info.is_evictable {
                continue;
            }

            let k_dist = info.k_distance(now, self.k);
            let earliest = info.earliest_timestamp();

            let should_replace = match (victim_k_dist, k_dist) {
                // Victim at +inf, candidate finite: keep victim
                (None, Some(_)) => false,
                // Victim finite, candidate at +inf: take candidate
                (Some(_), None) => true,
                // Both +inf: earlier first access wins
                (None, None) => match (victim_earliest, earliest) {
                    (Some(v_ts), Some(c_ts)) => c_ts < v_ts,
                    (None, Some(_)) => true,
                    _ => false,
                },
                // Both finite: larger distance wins, ties broken by the
                // earlier retained timestamp
                (Some(v_dist), Some(c_dist)) => {
                    c_dist > v_dist || (c_dist == v_dist && earliest < victim_earliest)
                }
            };

            if victim.is_none() || should_replace {
                victim = Some(*frame_id);
                victim_k_dist = k_dist;
                victim_earliest = earliest;
            }
        }

        if let Some(frame_id) = victim {
            inner.frame_info.remove(&frame_id);
            inner.num_evictable -= 1;
            trace!(frame_id = frame_id.as_u32(), "evicted frame");
        }

        victim
    }

    /// Records an access to the given frame at a fresh timestamp. Unknown
    /// frames start being tracked as non-evictable. Out-of-range frame ids
    /// are ignored.
    pub fn record_access(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut inner = self.inner.lock();
        inner.current_timestamp += 1;
        let timestamp = inner.current_timestamp;

        inner
            .frame_info
            .entry(frame_id)
            .or_insert_with(FrameAccessInfo::new)
            .record_access(timestamp, self.k);
    }

    /// Toggles a frame's evictability, keeping the evictable count in step.
    /// Unknown and out-of-range frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut inner = self.inner.lock();
        let ReplacerInner {
            frame_info,
            num_evictable,
            ..
        } = &mut *inner;

        if let Some(info) = frame_info.get_mut(&frame_id) {
            if info.is_evictable != is_evictable {
                if is_evictable {
                    *num_evictable += 1;
                } else {
                    *num_evictable -= 1;
                }
                info.is_evictable = is_evictable;
            }
        }
    }

    /// Stops tracking an evictable frame. Non-evictable frames are left in
    /// place; callers must mark a frame evictable before removing it.
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();

        let is_evictable = inner
            .frame_info
            .get(&frame_id)
            .map(|info| info.is_evictable);
        if is_evictable == Some(true) {
            inner.frame_info.remove(&frame_id);
            inner.num_evictable -= 1;
        }
    }

    /// Number of currently evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().num_evictable
    }

    pub fn k(&self) -> usize {
        self.k
    }
}
