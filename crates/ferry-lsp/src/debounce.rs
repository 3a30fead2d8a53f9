//! Event debouncing, one timer per discipline.
//!
//! Linting uses a reset-on-trigger single-shot timer: a burst of editor
//! events arms the timer once and keeps pushing it back, and exactly one
//! request (the latest) is enqueued after quiescence. Formatting uses a
//! gate instead: while the gate is armed, further format requests are
//! dropped with an empty edit list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::lint::LintRequest;

/// Reset-on-trigger timer feeding the lint queue.
pub struct LintDebouncer {
    tx: UnboundedSender<LintRequest>,
    pending: Arc<Mutex<Option<LintRequest>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl LintDebouncer {
    pub fn new(tx: UnboundedSender<LintRequest>) -> Self {
        Self {
            tx,
            pending: Arc::new(Mutex::new(None)),
            timer: Mutex::new(None),
        }
    }

    /// Record `request` as the pending event and (re)arm the timer.
    pub fn trigger(&self, delay: Duration, request: LintRequest) {
        *self.pending.lock().unwrap() = Some(request);

        let mut timer = self.timer.lock().unwrap();
        if let Some(handle) = timer.take() {
            handle.abort();
        }

        let pending = Arc::clone(&self.pending);
        let tx = self.tx.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(request) = pending.lock().unwrap().take() {
                let _ = tx.send(request);
            }
        }));
    }

    /// Stop the pending timer, dropping any queued event.
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
        self.pending.lock().unwrap().take();
    }
}

/// Rate-limit gate for format requests.
pub struct FormatGate {
    armed: Arc<AtomicBool>,
}

impl FormatGate {
    pub fn new() -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns false while a previous acquisition is still within `delay`.
    pub fn try_acquire(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        if self
            .armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let armed = Arc::clone(&self.armed);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            armed.store(false, Ordering::SeqCst);
        });
        true
    }
}

impl Default for FormatGate {
    fn default() -> Self {
        Self::new()
    }
}
