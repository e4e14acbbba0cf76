//! Process-wide connection counting.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Returns whether `current` claimed slots fit under `max` (0 = unlimited).
pub fn try_admit(current: i64, max: i64) -> bool {
    max == 0 || current <= max
}

/// Counts claimed session slots against a configured maximum.
#[derive(Debug)]
pub struct AdmissionGate {
    connections: AtomicI64,
    max: i64,
}

impl AdmissionGate {
    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(Self {
            connections: AtomicI64::new(0),
            max: i64::from(max),
        })
    }

    /// Claim a slot. The counter is incremented even when the claim is over
    /// the limit; the returned slot releases it on drop either way.
    pub fn claim(self: &Arc<Self>) -> AdmissionSlot {
        let current = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let admitted = try_admit(current, self.max);
        if !admitted {
            warn!(current, max = self.max, "Reached max connection");
        }
        AdmissionSlot {
            gate: Arc::clone(self),
            current,
            admitted,
            released: AtomicBool::new(false),
        }
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> i64 {
        self.max
    }
}

/// One unit of the connection budget. Released exactly once.
#[derive(Debug)]
pub struct AdmissionSlot {
    gate: Arc<AdmissionGate>,
    current: i64,
    admitted: bool,
    released: AtomicBool,
}

impl AdmissionSlot {
    pub fn admitted(&self) -> bool {
        self.admitted
    }

    /// Counter value observed right after this slot was claimed.
    pub fn current(&self) -> i64 {
        self.current
    }

    /// Give the slot back. Later calls (and the drop) are no-ops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.gate.connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release();
    }
}
