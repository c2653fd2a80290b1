//! Progress reporting and cooperative cancellation.
//!
//! Long operations (core calls, workspace load/save) advance a [`ProgressTracker`]
//! one step at a time. Every step checks the tracker's cancellation token first, so
//! cancelling the token stops the operation at its next step.

use std::fmt;

use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

/// The operation was aborted through its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Receiver of unit progress steps.
pub trait Step {
    fn step(&mut self) -> Result<(), Cancelled>;
}

type ProgressCallback = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Position/work-size pair plus the token that can abort the work.
pub struct ProgressTracker {
    token: CancellationToken,
    position: u64,
    work_size: Option<u64>,
    on_progress: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            position: 0,
            work_size: None,
            on_progress: None,
        }
    }

    /// Tracker with a private token nobody else can cancel.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Called with `(position, work_size)` after every position change.
    pub fn with_callback(mut self, f: impl FnMut(u64, Option<u64>) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn work_size(&self) -> Option<u64> {
        self.work_size
    }

    /// Start a new unit of work; the position goes back to zero.
    pub fn set_work_size(&mut self, size: u64) {
        self.work_size = Some(size);
        self.position = 0;
        self.notify();
    }

    pub fn set_position(&mut self, position: u64) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled);
        }
        self.position = position;
        self.notify();
        Ok(())
    }

    fn notify(&mut self) {
        if let Some(cb) = self.on_progress.as_mut() {
            cb(self.position, self.work_size);
        }
    }
}

impl Step for ProgressTracker {
    fn step(&mut self) -> Result<(), Cancelled> {
        self.set_position(self.position + 1)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::detached()
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("position", &self.position)
            .field("work_size", &self.work_size)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn steps_advance_position() {
        let mut tracker = ProgressTracker::detached();
        tracker.set_work_size(3);
        tracker.step().unwrap();
        tracker.step().unwrap();
        assert_eq!(tracker.position(), 2);
        assert_eq!(tracker.work_size(), Some(3));
    }

    #[test]
    fn cancelled_token_stops_next_step() {
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new(token.clone());
        tracker.step().unwrap();
        token.cancel();
        assert_eq!(tracker.step(), Err(Cancelled));
        assert_eq!(tracker.position(), 1);
    }

    #[test]
    fn callback_sees_every_update() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut tracker = ProgressTracker::detached()
            .with_callback(move |pos, size| sink.lock().unwrap().push((pos, size)));
        tracker.set_work_size(2);
        tracker.step().unwrap();
        tracker.set_position(2).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, Some(2)), (1, Some(2)), (2, Some(2))]
        );
    }

    #[test]
    fn work_size_resets_position() {
        let mut tracker = ProgressTracker::detached();
        tracker.set_position(10).unwrap();
        tracker.set_work_size(4);
        assert_eq!(tracker.position(), 0);
    }
}
