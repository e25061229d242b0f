use parking_lot::Mutex;

/// Issues strictly increasing millisecond timestamps for every call into the
/// shared landmark runtime.
///
/// Sub-detectors that feed one streaming runtime must never receive a
/// duplicate or decreasing timestamp; the runtime treats that as an internal
/// desynchronization that can only be repaired by rebuilding every
/// sub-detector. One clock instance is shared by the whole detector family.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_issued: Mutex<u64>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `max(candidate_ms, last_issued + 1)` and remember it.
    pub fn next_timestamp(&self, candidate_ms: u64) -> u64 {
        let mut last = self.last_issued.lock();
        let next = candidate_ms.max(*last + 1);
        *last = next;
        next
    }

    /// Last value handed out, 0 if none yet.
    pub fn last_issued(&self) -> u64 {
        *self.last_issued.lock()
    }

    /// Restart from zero. Only valid when the shared runtime itself is being
    /// fully reinitialized; resetting under a live runtime reintroduces the
    /// duplicate-timestamp failure this clock exists to prevent.
    pub fn reset(&self) {
        *self.last_issued.lock() = 0;
    }
}
