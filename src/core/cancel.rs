//! Cooperative cancellation shared across a run.
//!
//! The token is observed at suspension points only: backend calls, backoff
//! sleeps, subprocess waits, clone walks, and blob writes. Cancelling does
//! not roll back changes already applied to a real workspace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Returned from a suspension point once the token has been cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Shared cancellation flag, cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if the token has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early (with an error) on cancellation.
    ///
    /// The sleep is sliced so cancellation is observed within ~50ms.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        const SLICE: Duration = Duration::from_millis(50);
        let mut remaining = duration;
        while !remaining.is_zero() {
            self.check()?;
            let step = remaining.min(SLICE);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        self.check()
    }
}
