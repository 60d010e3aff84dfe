//! Cooperative cancellation for pipeline runs

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct CancelInner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `rx` and wakes every waiter
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Shared cancellation signal
///
/// The driver checks it at the top of each loop iteration and while waiting
/// for completions. Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Raise the signal; later calls have no effect
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.tx.lock().take();
            tracing::info!("Cancellation requested");
        }
    }

    /// Wait up to `timeout` for cancellation
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }

    /// Cancel automatically once `duration` has passed
    ///
    /// Used for timed captures such as recording for a number of seconds. The
    /// timer thread exits early if the token is cancelled some other way.
    pub fn cancel_after(&self, duration: Duration) -> JoinHandle<()> {
        let token = self.clone();
        thread::spawn(move || {
            if !token.wait_timeout(duration) {
                tracing::info!("Capture timeout of {:?} elapsed", duration);
                token.cancel();
            }
        })
    }

    /// Receiver that disconnects on cancellation, for use in `select`
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
