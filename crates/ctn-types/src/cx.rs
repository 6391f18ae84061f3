//! Capability context for cooperative cancellation.
//!
//! A `Cx` carries the process-wide "termination requested" flag. Signal
//! handlers only ever flip the flag; long-running code calls
//! [`Cx::checkpoint`] at safe points and unwinds through ordinary error
//! propagation so that open sessions are closed by their owners.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Returned by [`Cx::checkpoint`] once termination has been requested.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("termination requested")]
pub struct Stopped;

#[derive(Debug, Clone, Default)]
pub struct Cx {
    stop: Arc<AtomicBool>,
}

impl Cx {
    /// Context for a command invocation. Clones share one flag.
    #[must_use]
    pub fn for_request() -> Self {
        Self::default()
    }

    /// Context for unit tests; identical to [`Cx::for_request`] but named for
    /// readability at call sites.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::default()
    }

    /// Ask every holder of this context to stop at its next checkpoint.
    ///
    /// Only performs an atomic store, so it is safe to call from a signal
    /// handling thread.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Fail with [`Stopped`] if termination has been requested.
    pub fn checkpoint(&self) -> Result<(), Stopped> {
        if self.stop_requested() {
            Err(Stopped)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_fails_after_stop_on_any_clone() {
        let cx = Cx::for_testing();
        let handler_side = cx.clone();
        assert_eq!(cx.checkpoint(), Ok(()));

        handler_side.request_stop();
        assert!(cx.stop_requested());
        assert_eq!(cx.checkpoint(), Err(Stopped));
    }
}
