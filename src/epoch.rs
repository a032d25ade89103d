//! Epoch lifecycle
//!
//! Records carry an epoch tag; epoch boundaries are synchronized by the
//! surrounding application's barrier. The ledger counts frames in
//! flight per epoch — charged at enqueue, discharged when the transport
//! completion fires — and is the sole thing `epoch_end` observes to
//! know the epoch has drained. Charge and discharge serialize on one
//! mutex, so the counter is linearizable against both sides.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};

/// Per-epoch in-flight accounting
pub struct EpochLedger {
    state: Mutex<LedgerState>,
    cv: Condvar,
}

struct LedgerState {
    current: u16,
    inflight: AHashMap<u16, u64>,
}

impl EpochLedger {
    /// Create a ledger positioned at epoch 0 with nothing in flight
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                current: 0,
                inflight: AHashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// The current epoch
    pub fn current(&self) -> u16 {
        self.state.lock().current
    }

    /// Make `epoch` current, returning whatever was still in flight for
    /// it (zero on a healthy job; the caller decides how loudly a
    /// nonzero count fails)
    pub fn begin_epoch(&self, epoch: u16) -> u64 {
        let mut state = self.state.lock();
        state.current = epoch;
        state.inflight.get(&epoch).copied().unwrap_or(0)
    }

    /// Charge one frame against `epoch`
    pub fn charge(&self, epoch: u16) {
        let mut state = self.state.lock();
        *state.inflight.entry(epoch).or_insert(0) += 1;
    }

    /// Discharge one frame from `epoch`, waking drain waiters when the
    /// count reaches zero
    pub fn discharge(&self, epoch: u16) {
        let mut state = self.state.lock();
        let count = state
            .inflight
            .get_mut(&epoch)
            .expect("discharge without a matching charge");
        *count -= 1;
        if *count == 0 {
            state.inflight.remove(&epoch);
            drop(state);
            self.cv.notify_all();
        }
    }

    /// Frames currently in flight for `epoch`
    pub fn inflight(&self, epoch: u16) -> u64 {
        self.state.lock().inflight.get(&epoch).copied().unwrap_or(0)
    }

    /// Wait until `epoch` drains, up to `timeout`. Returns whether the
    /// epoch drained. Idempotent: a drained epoch returns immediately.
    pub fn wait_drained(&self, epoch: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.inflight.get(&epoch).copied().unwrap_or(0) == 0 {
                return true;
            }
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                return state.inflight.get(&epoch).copied().unwrap_or(0) == 0;
            }
        }
    }
}

impl Default for EpochLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_charge_discharge() {
        let ledger = EpochLedger::new();
        assert_eq!(ledger.inflight(0), 0);
        ledger.charge(0);
        ledger.charge(0);
        ledger.charge(1);
        assert_eq!(ledger.inflight(0), 2);
        assert_eq!(ledger.inflight(1), 1);
        ledger.discharge(0);
        ledger.discharge(0);
        assert_eq!(ledger.inflight(0), 0);
        assert_eq!(ledger.inflight(1), 1);
    }

    #[test]
    fn test_begin_epoch_reports_leftovers() {
        let ledger = EpochLedger::new();
        ledger.charge(3);
        assert_eq!(ledger.begin_epoch(3), 1);
        assert_eq!(ledger.current(), 3);
        ledger.discharge(3);
        assert_eq!(ledger.begin_epoch(4), 0);
    }

    #[test]
    fn test_wait_drained_is_idempotent() {
        let ledger = EpochLedger::new();
        // Nothing in flight: returns at once, repeatedly.
        assert!(ledger.wait_drained(0, Duration::from_millis(1)));
        assert!(ledger.wait_drained(0, Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_drained_times_out() {
        let ledger = EpochLedger::new();
        ledger.charge(5);
        assert!(!ledger.wait_drained(5, Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_drained_wakes_on_last_discharge() {
        let ledger = Arc::new(EpochLedger::new());
        ledger.charge(2);
        ledger.charge(2);

        let ledger2 = Arc::clone(&ledger);
        let waiter =
            thread::spawn(move || ledger2.wait_drained(2, Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        ledger.discharge(2);
        ledger.discharge(2);
        assert!(waiter.join().unwrap());
    }
}
