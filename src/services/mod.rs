//! Device interaction services
//!
//! The scan poller and the firmware uploader own their state and drive one
//! operation at a time. The remaining services are stateless wrappers around
//! the device API that add validation and reply checking.

pub mod firmware;
pub mod network;
pub mod scan;
pub mod settings;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};

/// Interactive confirmation gate for operations that reboot the device
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Holds the in-flight flag of a driver until dropped
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    /// Returns `None` if another operation already holds the flag
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
