//! Admission control for job attempts
//!
//! Every attempt (first try and each retry) reserves one slot before it runs.
//! Slots are never returned directly. A finished attempt leaves a release hint
//! instead, and once per rate window the controller reclaims
//! `min(hints, reserved)` slot/hint pairs. Between window ticks the number of
//! reserved slots can only grow, which caps the attempts started per window at
//! `job_limit` plus whatever was reclaimed.

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Counters returned by a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub limit: usize,
    pub reserved: usize,
    pub pending_hints: usize,
    pub attempts_in_window: u64,
    pub total_acquired: u64,
    pub total_reclaimed: u64,
}

/// Result of one window reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowReport {
    /// Slot/hint pairs removed
    pub reclaimed: usize,
    /// Slots still reserved afterwards
    pub reserved: usize,
    /// Hints still pending afterwards
    pub pending_hints: usize,
    /// Attempts admitted during the window that just closed
    pub attempts_in_window: u64,
}

/// Synchronous slot accounting
///
/// Holds `hints <= reserved <= limit` at all times.
#[derive(Debug, Clone)]
pub struct WindowState {
    limit: usize,
    reserved: usize,
    hints: usize,
    attempts_in_window: u64,
    total_acquired: u64,
    total_reclaimed: u64,
}

impl WindowState {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            reserved: 0,
            hints: 0,
            attempts_in_window: 0,
            total_acquired: 0,
            total_reclaimed: 0,
        }
    }

    /// Reserve a slot if one is free
    pub fn try_reserve(&mut self) -> bool {
        if self.available() == 0 {
            return false;
        }
        self.reserved += 1;
        self.attempts_in_window += 1;
        self.total_acquired += 1;
        true
    }

    /// Record a release hint
    ///
    /// Hints beyond the reserved count have no slot to pair with (this only
    /// happens after an external reset) and are dropped. Returns whether the
    /// hint was recorded.
    pub fn hint(&mut self) -> bool {
        if self.hints >= self.reserved {
            return false;
        }
        self.hints += 1;
        true
    }

    /// Remove `min(hints, reserved)` pairs and close the window
    pub fn reconcile(&mut self) -> WindowReport {
        let reclaimed = self.hints.min(self.reserved);
        self.hints -= reclaimed;
        self.reserved -= reclaimed;
        self.total_reclaimed += reclaimed as u64;

        let attempts_in_window = std::mem::take(&mut self.attempts_in_window);
        WindowReport {
            reclaimed,
            reserved: self.reserved,
            pending_hints: self.hints,
            attempts_in_window,
        }
    }

    /// Drop every reservation and hint
    pub fn reset(&mut self) -> usize {
        let cleared = self.reserved;
        self.reserved = 0;
        self.hints = 0;
        cleared
    }

    /// Slots left in the current window
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.reserved)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            limit: self.limit,
            reserved: self.reserved,
            pending_hints: self.hints,
            attempts_in_window: self.attempts_in_window,
            total_acquired: self.total_acquired,
            total_reclaimed: self.total_reclaimed,
        }
    }
}

/// Async admission controller shared by workers, attempts and the window loop
#[derive(Debug)]
pub struct AdmissionController {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        debug!(limit, "AdmissionController::new: called");
        Self {
            state: Mutex::new(WindowState::new(limit)),
            notify: Notify::new(),
        }
    }

    /// Wait for a free slot and reserve it
    pub async fn acquire(&self) {
        debug!("AdmissionController::acquire: called");
        loop {
            // Register interest before checking, so a wake between the check
            // and the await is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().await.try_reserve() {
                debug!("AdmissionController::acquire: slot reserved");
                return;
            }

            debug!("AdmissionController::acquire: exhausted, waiting for window");
            notified.await;
        }
    }

    /// Mark one attempt as finished, eligible for reclaim at the next tick
    pub async fn release_hint(&self) {
        let recorded = self.state.lock().await.hint();
        debug!(recorded, "AdmissionController::release_hint: called");
    }

    /// Close the current window
    pub async fn reconcile(&self) -> WindowReport {
        let report = self.state.lock().await.reconcile();
        debug!(?report, "AdmissionController::reconcile: done");
        if report.reclaimed > 0 {
            self.notify.notify_waiters();
        }
        report
    }

    /// Restore full capacity immediately
    pub async fn reset_window(&self) -> usize {
        let cleared = self.state.lock().await.reset();
        info!(cleared, "Admission window reset");
        self.notify.notify_waiters();
        cleared
    }

    pub async fn snapshot(&self) -> AdmissionStats {
        self.state.lock().await.stats()
    }
}
