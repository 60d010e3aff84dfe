//! Coalescing wake-up signal between completion callbacks and the driver
//!
//! Backed by a one-slot channel: any number of `set` calls before the driver
//! looks collapse into a single pending wake.

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use std::time::Duration;

/// One-shot "work is pending" flag
pub struct Trigger {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Trigger {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Raise the flag
    /// Returns false if it was already raised
    pub fn set(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    pub fn is_set(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Lower the flag
    /// Returns whether it had been raised
    pub fn reset(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Wait for the flag and lower it
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until any of `triggers` is raised, without lowering it
///
/// `interrupt` is an extra receiver that ends the wait early when it becomes
/// ready or disconnected.
pub fn wait_any(
    triggers: &[&Trigger],
    interrupt: Option<&Receiver<()>>,
    timeout: Duration,
) -> bool {
    if triggers.iter().any(|t| t.is_set()) {
        return true;
    }
    let mut select = Select::new();
    for trigger in triggers {
        select.recv(trigger.receiver());
    }
    if let Some(rx) = interrupt {
        select.recv(rx);
    }
    select.ready_timeout(timeout).is_ok() && triggers.iter().any(|t| t.is_set())
}
