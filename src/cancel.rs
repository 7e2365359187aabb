use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{RenderError, Result};

/// Shared stop flag for one orchestrator.
///
/// Cloning shares the flag. Setting and clearing never block and are safe
/// from any thread; the orchestrator only looks at it at its checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the current run to stop at its next checkpoint.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint helper: `Err(Cancelled)` once a stop was requested.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_requested() {
            return Err(RenderError::Cancelled);
        }
        Ok(())
    }
}
