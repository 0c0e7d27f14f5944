//! Cooperative cancellation shared by a build and its subprocesses.
//!
//! A token is tripped explicitly with [`CancelToken::cancel`] or implicitly
//! when its deadline passes. Child tokens observe their parent, so a worker
//! failure can stop its siblings without cancelling the whole build.

use crate::error::BuildError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Some(Instant::now() + timeout),
                ..Inner::default()
            }),
        }
    }

    /// A token that trips when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                ..Inner::default()
            }),
        }
    }

    /// A child that also trips once `timeout` has elapsed.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Some(Instant::now() + timeout),
                parent: Some(self.clone()),
                ..Inner::default()
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().is_err()
    }

    /// `Err(Cancelled)` or `Err(TimedOut)` once the token has tripped.
    pub fn check(&self) -> Result<(), BuildError> {
        self.state()
    }

    fn state(&self) -> Result<(), BuildError> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Err(BuildError::Cancelled);
        }
        if self.inner.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(BuildError::TimedOut);
        }
        match &self.inner.parent {
            Some(parent) => parent.state(),
            None => Ok(()),
        }
    }
}
