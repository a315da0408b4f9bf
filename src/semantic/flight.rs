//! Single-flight guards.
//!
//! A `Flight` admits at most one holder at a time. Acquisition never waits:
//! a second caller is told the operation is busy. The returned ticket
//! releases the flight when dropped, so every exit path (including unwinding)
//! frees it.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct Flight {
    active: AtomicBool,
}

/// Proof of holding a `Flight`. Releases it on drop.
#[derive(Debug)]
pub struct FlightTicket<'a> {
    flight: &'a Flight,
}

impl Flight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to start a flight. Returns `None` if one is already active.
    pub fn try_acquire(&self) -> Option<FlightTicket<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightTicket { flight: self })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for FlightTicket<'_> {
    fn drop(&mut self) {
        self.flight.active.store(false, Ordering::Release);
    }
}
