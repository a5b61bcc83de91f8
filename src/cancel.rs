//! Cooperative cancellation for store, analyzer and sync operations.
//!
//! Long-running calls take a [`CancellationToken`] and call
//! [`CancellationToken::checkpoint`] between units of work. A token trips
//! when it is cancelled explicitly (from any clone) or when its deadline
//! passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CovtrendError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// A token that only trips when cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Return `Cancelled` if the token has tripped.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CovtrendError::Cancelled)
        } else {
            Ok(())
        }
    }
}
