//! Small synchronization helpers.

use std::sync::atomic::{AtomicBool, Ordering};

/// A single-fire latch.
///
/// [`fire`](OneTime::fire) returns `true` for exactly one caller, however
/// many race for it.
#[derive(Debug, Default)]
pub struct OneTime {
    fired: AtomicBool,
}

impl OneTime {
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Trips the latch. Returns `true` only for the first call.
    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the latch has been tripped.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
