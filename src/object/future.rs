//! Completion tracking for asynchronous render submissions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Handle-addressable completion state for one submitted frame.
///
/// The future is created pending and transitions to ready exactly once;
/// repeated completion signals keep the first completion timestamp.
pub struct RenderFuture {
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    progress: Mutex<f32>,
    created_at: DateTime<Utc>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl RenderFuture {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            ready_tx,
            ready_rx,
            progress: Mutex::new(0.0),
            created_at: Utc::now(),
            completed_at: Mutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Signal completion. Only the first call records the completion time.
    pub fn mark_ready(&self) {
        let was_ready = self.ready_tx.send_replace(true);
        if !was_ready {
            *self.progress.lock() = 1.0;
            *self.completed_at.lock() = Some(Utc::now());
        }
    }

    /// Wait until the frame completes; returns immediately once ready.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fraction of the frame completed so far, in `[0, 1]`
    pub fn progress(&self) -> f32 {
        *self.progress.lock()
    }

    pub fn set_progress(&self, fraction: f32) {
        *self.progress.lock() = fraction.clamp(0.0, 1.0);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.lock()
    }

    /// Wall-clock time from submission to completion
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at().map(|done| done - self.created_at)
    }
}

impl Default for RenderFuture {
    fn default() -> Self {
        Self::new()
    }
}
