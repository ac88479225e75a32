//! Worker-local ready queues and the slack-histogram extractor.
//!
//! Three interchangeable variants behind one sum type: a mutex FIFO for the
//! baselines, a mutex min-heap keyed by absolute deadline, and a timing
//! wheel that trades strict EDF order inside a bucket for per-bucket locks.

use crate::rpc::ReqHandle;
use crate::time::Timestamp;
use crate::wire::{RequestType, SLACK_BINS, SLACK_BIN_WIDTH_NS};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Unit of work travelling receive -> ready queue -> compute -> completion.
///
/// The response handle is carried along but only the I/O thread, which owns
/// the endpoint, can turn it back into a network send.
#[derive(Debug)]
pub struct Task {
    pub id: u64,
    pub deadline: Timestamp,
    pub arrival_ts: Timestamp,
    pub client_send_ts: Timestamp,
    pub service_hint_us: u32,
    pub request_type: RequestType,
    pub payload_size: u16,
    pub handle: Option<ReqHandle>,
    // Filled by the compute side before the task enters the completion queue.
    pub done_ts: Timestamp,
    pub actual_service_ns: u64,
    pub queue_wait_ns: u64,
}

impl Task {
    pub fn slack(&self, now: Timestamp) -> i64 {
        self.deadline as i64 - now as i64
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.deadline <= now
    }
}

/// Histogram bin for a signed slack value: bin 0 is "already expired",
/// bins 1.. cover successive 100 us windows, the last bin is open-ended.
fn slack_bin(slack: i64) -> usize {
    if slack <= 0 {
        0
    } else {
        ((slack as u64 / SLACK_BIN_WIDTH_NS) as usize + 1).min(SLACK_BINS - 1)
    }
}

fn histogram_of<'a>(tasks: impl Iterator<Item = &'a Task>, now: Timestamp) -> [u32; SLACK_BINS] {
    let mut hist = [0u32; SLACK_BINS];
    for task in tasks {
        hist[slack_bin(task.slack(now))] += 1;
    }
    hist
}

/// Mutex-protected FIFO used by the baseline configurations.
pub struct FcfsQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl FcfsQueue {
    pub fn new() -> FcfsQueue {
        FcfsQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: Task) {
        self.inner.lock().push_back(task);
    }

    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn slack_histogram(&self, now: Timestamp) -> [u32; SLACK_BINS] {
        histogram_of(self.inner.lock().iter(), now)
    }
}

impl Default for FcfsQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct HeapEntry(Task);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (earliest deadline first)
        other.0.deadline.cmp(&self.0.deadline)
    }
}

/// Mutex-protected min-heap keyed by absolute deadline.
pub struct EdfHeapQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
}

impl EdfHeapQueue {
    pub fn new() -> EdfHeapQueue {
        EdfHeapQueue {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn push(&self, task: Task) {
        self.heap.lock().push(HeapEntry(task));
    }

    pub fn try_pop(&self) -> Option<Task> {
        self.heap.lock().pop().map(|entry| entry.0)
    }

    pub fn peek_deadline(&self) -> Option<Timestamp> {
        self.heap.lock().peek().map(|entry| entry.0.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn slack_histogram(&self, now: Timestamp) -> [u32; SLACK_BINS] {
        let heap = self.heap.lock();
        histogram_of(heap.iter().map(|entry| &entry.0), now)
    }
}

impl Default for EdfHeapQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of wheel buckets.
pub const WHEEL_BUCKETS: usize = 1024;

/// Width of one wheel bucket in nanoseconds (1 us; full horizon ~1 ms).
pub const WHEEL_BUCKET_WIDTH_NS: u64 = 1_000;

/// Timing wheel: O(1) insert under a per-bucket lock. Popping scans
/// backwards from the current-time bucket over at most an eighth of the
/// ring and takes the minimum-deadline task of the first non-empty bucket,
/// so tasks sharing a bucket are EDF-ordered only by that scan selection.
pub struct TimingWheel {
    buckets: Vec<Mutex<Vec<Task>>>,
    bucket_width_ns: u64,
    total: AtomicUsize,
}

impl TimingWheel {
    pub fn new() -> TimingWheel {
        Self::with_bucket_width(WHEEL_BUCKET_WIDTH_NS)
    }

    pub fn with_bucket_width(bucket_width_ns: u64) -> TimingWheel {
        TimingWheel {
            buckets: (0..WHEEL_BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
            bucket_width_ns,
            total: AtomicUsize::new(0),
        }
    }

    fn bucket_index(&self, deadline: Timestamp) -> usize {
        ((deadline / self.bucket_width_ns) % WHEEL_BUCKETS as u64) as usize
    }

    pub fn push(&self, task: Task) {
        let idx = self.bucket_index(task.deadline);
        self.buckets[idx].lock().push(task);
        self.total.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Pop the most urgent task near `now`, if any bucket in the scan
    /// window holds one.
    pub fn try_pop(&self, now: Timestamp) -> Option<Task> {
        let current = ((now / self.bucket_width_ns) % WHEEL_BUCKETS as u64) as usize;
        for offset in 0..WHEEL_BUCKETS / 8 {
            let idx = (current + WHEEL_BUCKETS - offset) % WHEEL_BUCKETS;
            let mut bucket = self.buckets[idx].lock();
            if bucket.is_empty() {
                continue;
            }
            let min_pos = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, task)| task.deadline)
                .map(|(pos, _)| pos)
                .unwrap_or(0);
            let task = bucket.swap_remove(min_pos);
            self.total.fetch_sub(1, AtomicOrdering::Relaxed);
            return Some(task);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.total.load(AtomicOrdering::Relaxed)
    }

    pub fn slack_histogram(&self, now: Timestamp) -> [u32; SLACK_BINS] {
        let mut hist = [0u32; SLACK_BINS];
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for task in bucket.iter() {
                hist[slack_bin(task.slack(now))] += 1;
            }
        }
        hist
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue variant selected per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Fcfs,
    EdfHeap,
    EdfWheel,
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(QueueKind::Fcfs),
            "edf" | "edf-heap" | "edf_heap" => Ok(QueueKind::EdfHeap),
            "edf-wheel" | "edf_wheel" | "wheel" => Ok(QueueKind::EdfWheel),
            other => Err(format!("unknown queue kind: {other}")),
        }
    }
}

/// Ready queue behind a single sum type so the worker runtime stays
/// oblivious to the variant in use.
pub enum TaskQueue {
    Fcfs(FcfsQueue),
    EdfHeap(EdfHeapQueue),
    EdfWheel(TimingWheel),
}

impl TaskQueue {
    pub fn new(kind: QueueKind) -> TaskQueue {
        match kind {
            QueueKind::Fcfs => TaskQueue::Fcfs(FcfsQueue::new()),
            QueueKind::EdfHeap => TaskQueue::EdfHeap(EdfHeapQueue::new()),
            QueueKind::EdfWheel => TaskQueue::EdfWheel(TimingWheel::new()),
        }
    }

    pub fn push(&self, task: Task) {
        match self {
            TaskQueue::Fcfs(q) => q.push(task),
            TaskQueue::EdfHeap(q) => q.push(task),
            TaskQueue::EdfWheel(q) => q.push(task),
        }
    }

    pub fn try_pop(&self, now: Timestamp) -> Option<Task> {
        match self {
            TaskQueue::Fcfs(q) => q.try_pop(),
            TaskQueue::EdfHeap(q) => q.try_pop(),
            TaskQueue::EdfWheel(q) => q.try_pop(now),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskQueue::Fcfs(q) => q.len(),
            TaskQueue::EdfHeap(q) => q.len(),
            TaskQueue::EdfWheel(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slack_histogram(&self, now: Timestamp) -> [u32; SLACK_BINS] {
        match self {
            TaskQueue::Fcfs(q) => q.slack_histogram(now),
            TaskQueue::EdfHeap(q) => q.slack_histogram(now),
            TaskQueue::EdfWheel(q) => q.slack_histogram(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64, deadline: Timestamp) -> Task {
        Task {
            id,
            deadline,
            arrival_ts: 0,
            client_send_ts: 0,
            service_hint_us: 10,
            request_type: RequestType::Get,
            payload_size: 64,
            handle: None,
            done_ts: 0,
            actual_service_ns: 0,
            queue_wait_ns: 0,
        }
    }

    #[test]
    fn fcfs_preserves_arrival_order() {
        let q = FcfsQueue::new();
        q.push(task(1, 300));
        q.push(task(2, 100));
        q.push(task(3, 200));
        assert_eq!(q.try_pop().unwrap().id, 1);
        assert_eq!(q.try_pop().unwrap().id, 2);
        assert_eq!(q.try_pop().unwrap().id, 3);
    }

    #[test]
    fn edf_heap_dequeues_in_deadline_order() {
        let q = EdfHeapQueue::new();
        let deadlines = [500u64, 100, 900, 300, 700, 200];
        for (i, d) in deadlines.iter().enumerate() {
            q.push(task(i as u64, *d));
        }
        // Between two pushes the sequence of dequeued deadlines is
        // non-decreasing.
        let mut prev = 0;
        while let Some(t) = q.try_pop() {
            assert!(t.deadline >= prev);
            prev = t.deadline;
        }
    }

    #[test]
    fn edf_heap_order_holds_across_interleaved_push() {
        let q = EdfHeapQueue::new();
        q.push(task(0, 400));
        q.push(task(1, 200));
        assert_eq!(q.try_pop().unwrap().deadline, 200);
        q.push(task(2, 100));
        assert_eq!(q.try_pop().unwrap().deadline, 100);
        assert_eq!(q.try_pop().unwrap().deadline, 400);
    }

    #[test]
    fn slack_histogram_sums_to_queue_size() {
        let q = EdfHeapQueue::new();
        let now = 1_000_000u64;
        q.push(task(0, now - 10)); // expired
        q.push(task(1, now + 50_000)); // first live bin
        q.push(task(2, now + 150_000)); // second live bin
        q.push(task(3, now + 10_000_000_000)); // clamps to last bin
        let hist = q.slack_histogram(now);
        assert_eq!(hist.iter().sum::<u32>() as usize, q.len());
        assert_eq!(hist[0], 1);
        assert_eq!(hist[1], 1);
        assert_eq!(hist[2], 1);
        assert_eq!(hist[SLACK_BINS - 1], 1);
    }

    #[test]
    fn expired_tasks_land_in_bin_zero_exactly() {
        let q = FcfsQueue::new();
        let now = 500_000u64;
        q.push(task(0, now)); // deadline == now counts as expired
        q.push(task(1, now + 1));
        let hist = q.slack_histogram(now);
        assert_eq!(hist[0], 1);
        assert_eq!(hist.iter().sum::<u32>(), 2);
    }

    #[test]
    fn wheel_pops_min_deadline_within_bucket() {
        let wheel = TimingWheel::new();
        let now = crate::time::now_ns();
        // Same bucket, different deadlines: the scan must take the smaller.
        let base = (now / WHEEL_BUCKET_WIDTH_NS) * WHEEL_BUCKET_WIDTH_NS;
        wheel.push(task(0, base + 900));
        wheel.push(task(1, base + 100));
        let popped = wheel.try_pop(now).expect("bucket scan found a task");
        assert_eq!(popped.id, 1);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn wheel_finds_overdue_tasks_behind_now() {
        let wheel = TimingWheel::new();
        let now = crate::time::now_ns();
        let overdue = now.saturating_sub(50 * WHEEL_BUCKET_WIDTH_NS);
        wheel.push(task(7, overdue));
        let popped = wheel.try_pop(now).expect("backward scan reaches it");
        assert_eq!(popped.id, 7);
    }

    #[test]
    fn queue_kind_parses_aliases() {
        assert_eq!(QueueKind::from_str("fcfs").unwrap(), QueueKind::Fcfs);
        assert_eq!(QueueKind::from_str("EDF").unwrap(), QueueKind::EdfHeap);
        assert_eq!(QueueKind::from_str("wheel").unwrap(), QueueKind::EdfWheel);
        assert!(QueueKind::from_str("lifo").is_err());
    }
}
