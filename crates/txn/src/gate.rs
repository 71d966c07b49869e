//! Reference-counted shutdown gate.
//!
//! Operations that must not outlive the manager register through `enter`
//! before doing work. `stop` closes the gate to new registrations and waits
//! for the outstanding ones to drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct ShutdownGate {
    stopping: AtomicBool,
    active: AtomicUsize,
    drained: Notify,
}

impl ShutdownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register intent to run. Returns `None` once the gate is stopping.
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        if self.stopping.load(Ordering::Acquire) {
            return None;
        }

        self.active.fetch_add(1, Ordering::AcqRel);

        // Re-check: stop may have raced between the first check and the
        // registration.
        if self.stopping.load(Ordering::Acquire) {
            self.release();
            return None;
        }

        Some(GateGuard { gate: self })
    }

    /// Close the gate and wait until every outstanding registration ends.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);

        loop {
            let notified = self.drained.notified();

            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a ShutdownGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
