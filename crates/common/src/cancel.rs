//! Operator-cancel signalling between the run driver and training loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Raised by a training loop that observed a cancel request.
///
/// The run driver recognises this error (and only this error) and moves on
/// to the next experiment.
#[derive(Debug, Clone, Copy, Error)]
#[error("experiment cancelled by operator")]
pub struct Cancelled;

/// Shared flag flipped by the signal handler and polled between training steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag; returns whether it was set.
    pub fn reset(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once a cancel request has been made.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything a module entry point receives besides its experiment.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(other.check().is_ok());
        token.cancel();
        assert!(other.is_cancelled());
        assert!(other.check().is_err());
        assert!(token.reset());
        assert!(!other.is_cancelled());
        assert!(!token.reset());
    }
}
