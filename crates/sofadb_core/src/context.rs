//! Request-scoped cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// A cancellation token threaded into every operation.
///
/// Operations call [`Context::check`] at each suspension point (store
/// access, iterator advance, sandbox invocation); a cancelled context makes
/// the next check return [`Error::Cancelled`]. Cloning shares the token, so
/// cancelling any clone cancels them all.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// A context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Cancels the context; in-flight operations observe it at their next
    /// suspension point.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the context has been cancelled or has passed its deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Returns `Err(Cancelled)` if the context has ended.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_cancelled() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn cancel_propagates_to_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(matches!(clone.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn deadline_expires() {
        let ctx = Context::with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
    }
}
