//! Pause gate shared by workers and attempts

use tokio::sync::watch;
use tracing::{debug, info};

/// Broadcast pause flag
///
/// While paused, every caller of `wait_if_paused` parks. `resume` releases
/// all of them at once.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns true if the gate was open before
    pub fn pause(&self) -> bool {
        let changed = self.tx.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        });
        if changed {
            info!("Paused");
        }
        changed
    }

    /// Returns true if the gate was closed before
    pub fn resume(&self) -> bool {
        let changed = self.tx.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Unpaused");
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Park until the gate is open
    pub async fn wait_if_paused(&self) {
        let mut rx = self.tx.subscribe();
        if !*rx.borrow_and_update() {
            return;
        }
        debug!("PauseGate::wait_if_paused: parked");
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|paused| !*paused).await;
        debug!("PauseGate::wait_if_paused: released");
    }
}
