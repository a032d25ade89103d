//! Sender queues and writer admission
//!
//! One FIFO per next-hop peer, drained by exactly one progress worker
//! so per-(src, dst) submission order survives the trip. Writer threads
//! are admitted through a shared gate that enforces the per-queue depth
//! bound and the rank-wide enqueued-byte budget; relay traffic arriving
//! on progress threads is charged but never parked, so the progress
//! pool cannot deadlock on its own back-pressure.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::nexus::Rank;

/// Cache line size for padding (typically 64 bytes on x86-64)
const CACHE_LINE_SIZE: usize = 64;

/// One enqueued frame awaiting transport
#[derive(Debug)]
pub struct QueueSlot {
    /// Originating rank
    pub src: Rank,

    /// Final destination rank
    pub dst: Rank,

    /// Epoch charged for this frame
    pub epoch: u16,

    /// The encoded envelope
    pub bytes: Vec<u8>,

    /// When the frame entered the queue
    pub submitted: Instant,
}

/// Per-queue statistics, updated with relaxed atomics and observed
/// globally only at finalize
#[repr(align(64))]
#[derive(Debug)]
pub struct QueueStats {
    /// Frames enqueued
    pub frames: AtomicU64,

    /// Bytes enqueued
    pub bytes: AtomicU64,

    /// Deepest the queue has been
    pub max_depth: AtomicU64,

    /// Sum of depth samples taken at each enqueue
    pub acc_depth: AtomicU64,

    /// Number of depth samples
    pub samples: AtomicU64,

    /// Total microseconds frames sat queued
    pub acc_wait_us: AtomicU64,

    _padding: [u8; CACHE_LINE_SIZE - 48],
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            max_depth: AtomicU64::new(0),
            acc_depth: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            acc_wait_us: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_SIZE - 48],
        }
    }
}

impl QueueStats {
    fn record_enqueue(&self, depth_after: usize, len: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.acc_depth.fetch_add(depth_after as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.max_depth.fetch_max(depth_after as u64, Ordering::Relaxed);
    }

    fn record_dequeue(&self, waited_us: u64) {
        self.acc_wait_us.fetch_add(waited_us, Ordering::Relaxed);
    }
}

/// Bounded FIFO toward one next-hop peer
pub struct SendQueue {
    /// The peer this queue drains toward
    pub peer: Rank,

    /// Queue statistics
    pub stats: QueueStats,

    tx: flume::Sender<QueueSlot>,
    rx: flume::Receiver<QueueSlot>,
    depth: AtomicUsize,
    stash: Mutex<Option<QueueSlot>>,
}

impl SendQueue {
    /// Create an empty queue toward `peer`
    pub fn new(peer: Rank) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            peer,
            stats: QueueStats::default(),
            tx,
            rx,
            depth: AtomicUsize::new(0),
            stash: Mutex::new(None),
        }
    }

    /// Current depth in frames
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a slot. Admission happens before this call; the queue
    /// itself never blocks.
    pub fn push(&self, slot: QueueSlot) -> Result<()> {
        let len = slot.bytes.len();
        self.tx.send(slot)?;
        let depth_after = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.record_enqueue(depth_after, len);
        Ok(())
    }

    /// Take the oldest slot, if any
    pub fn try_pop(&self) -> Option<QueueSlot> {
        if let Some(slot) = self.stash.lock().take() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Some(slot);
        }
        match self.rx.try_recv() {
            Ok(slot) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                self.stats
                    .record_dequeue(slot.submitted.elapsed().as_micros() as u64);
                Some(slot)
            }
            Err(_) => None,
        }
    }

    /// Put back a popped slot that did not fit the current batch.
    ///
    /// The slot is returned first by the next pop, so FIFO order
    /// survives. The single consumer stashes at most one slot between
    /// pops.
    pub fn unpop(&self, slot: QueueSlot) {
        let prev = self.stash.lock().replace(slot);
        debug_assert!(prev.is_none(), "only one slot may be stashed");
        self.depth.fetch_add(1, Ordering::AcqRel);
    }
}

/// Writer-thread admission gate.
///
/// Tracks the rank-wide enqueued-byte total; bytes are reserved at
/// admission and released when the transport completion fires, so the
/// total never exceeds `capacity`. Capacity must be at least the
/// largest admissible cost (the config validator floors it at one full
/// frame). Parked writers are woken by completions, by `epoch_start`,
/// and by close.
pub struct BudgetGate {
    capacity: usize,
    depth_limit: usize,
    state: Mutex<GateState>,
    cv: Condvar,
}

struct GateState {
    bytes: usize,
    closed: bool,
}

impl BudgetGate {
    /// Create a gate enforcing `capacity` total bytes and `depth_limit`
    /// frames per queue
    pub fn new(capacity: usize, depth_limit: usize) -> Self {
        Self {
            capacity,
            depth_limit,
            state: Mutex::new(GateState {
                bytes: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Admit `cost` bytes toward `queue`, parking the caller until both
    /// bounds clear. Fails with `Shutdown` once the gate closes.
    pub fn admit(&self, queue: &SendQueue, cost: usize) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Shutdown);
            }
            if self.would_admit(&state, queue, cost) {
                state.bytes += cost;
                return Ok(());
            }
            self.cv.wait(&mut state);
        }
    }

    /// Non-blocking admission: `Busy` instead of parking
    pub fn try_admit(&self, queue: &SendQueue, cost: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Shutdown);
        }
        if self.would_admit(&state, queue, cost) {
            state.bytes += cost;
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// Charge `cost` bytes without parking (relay traffic on progress
    /// threads)
    pub fn charge(&self, cost: usize) {
        self.state.lock().bytes += cost;
    }

    /// Return `cost` bytes and wake parked writers
    pub fn release(&self, cost: usize) {
        let mut state = self.state.lock();
        state.bytes = state.bytes.saturating_sub(cost);
        drop(state);
        self.cv.notify_all();
    }

    /// Bytes currently enqueued rank-wide
    pub fn in_use(&self) -> usize {
        self.state.lock().bytes
    }

    /// Wake every parked writer so it re-checks its predicate
    pub fn wake_all(&self) {
        self.cv.notify_all();
    }

    /// Close the gate; parked and future admissions fail with `Shutdown`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cv.notify_all();
    }

    fn would_admit(&self, state: &GateState, queue: &SendQueue, cost: usize) -> bool {
        queue.len() < self.depth_limit && state.bytes + cost <= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn slot(src: Rank, dst: Rank, epoch: u16, len: usize) -> QueueSlot {
        QueueSlot {
            src,
            dst,
            epoch,
            bytes: vec![0; len],
            submitted: Instant::now(),
        }
    }

    #[test]
    fn test_fifo_and_depth() {
        let q = SendQueue::new(3);
        assert!(q.is_empty());
        for i in 0..5 {
            q.push(slot(0, 3, i, 10)).unwrap();
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.try_pop().unwrap().epoch, i);
        }
        assert!(q.try_pop().is_none());
        assert_eq!(q.stats.frames.load(Ordering::Relaxed), 5);
        assert_eq!(q.stats.bytes.load(Ordering::Relaxed), 50);
        assert_eq!(q.stats.max_depth.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_try_admit_reports_busy() {
        let q = SendQueue::new(1);
        let gate = BudgetGate::new(100, 2);

        gate.try_admit(&q, 40).unwrap();
        q.push(slot(0, 1, 0, 40)).unwrap();
        gate.try_admit(&q, 40).unwrap();
        q.push(slot(0, 1, 0, 40)).unwrap();

        // Depth limit reached.
        assert_eq!(gate.try_admit(&q, 1), Err(Error::Busy));

        q.try_pop();
        // Depth cleared but the byte budget is exhausted.
        assert_eq!(gate.try_admit(&q, 40), Err(Error::Busy));
        gate.release(40);
        gate.try_admit(&q, 40).unwrap();
    }

    #[test]
    fn test_blocking_admit_waits_for_release() {
        let q = Arc::new(SendQueue::new(1));
        let gate = Arc::new(BudgetGate::new(50, 16));
        gate.admit(&q, 50).unwrap();

        let q2 = Arc::clone(&q);
        let gate2 = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            gate2.admit(&q2, 20).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        gate.release(50);
        waiter.join().unwrap();
        assert_eq!(gate.in_use(), 20);
    }

    #[test]
    fn test_close_releases_parked_writers() {
        let q = Arc::new(SendQueue::new(1));
        let gate = Arc::new(BudgetGate::new(10, 16));
        gate.admit(&q, 10).unwrap();

        let q2 = Arc::clone(&q);
        let gate2 = Arc::clone(&gate);
        let waiter = thread::spawn(move || gate2.admit(&q2, 5));

        thread::sleep(Duration::from_millis(20));
        gate.close();
        assert_eq!(waiter.join().unwrap(), Err(Error::Shutdown));
        assert_eq!(gate.try_admit(&q, 1), Err(Error::Shutdown));
    }

    #[test]
    fn test_budget_is_a_hard_ceiling() {
        // Even an idle gate refuses a cost above its capacity, so the
        // enqueued-byte total can never exceed it.
        let q = SendQueue::new(1);
        let gate = BudgetGate::new(8, 16);
        assert_eq!(gate.try_admit(&q, 64), Err(Error::Busy));
        assert_eq!(gate.in_use(), 0);
        gate.try_admit(&q, 8).unwrap();
        assert_eq!(gate.try_admit(&q, 1), Err(Error::Busy));
    }

    #[test]
    fn test_unpop_preserves_fifo() {
        let q = SendQueue::new(2);
        for i in 0..3 {
            q.push(slot(0, 2, i, 80)).unwrap();
        }

        let first = q.try_pop().unwrap();
        assert_eq!(first.epoch, 0);
        q.unpop(first);
        assert_eq!(q.len(), 3);

        // The stashed slot comes back first; order is unchanged.
        for i in 0..3 {
            assert_eq!(q.try_pop().unwrap().epoch, i);
        }
        assert!(q.try_pop().is_none());
    }
}
