// Interrupt handling
//
// The handler only flips a flag. Poll loops and interruptible commands check
// it and unwind through the normal error path, so cleanup runs on the main
// thread with the orchestrator's own state.

use crate::errors::{BerthError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once shutdown has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(BerthError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Route SIGINT and SIGTERM to a fresh shutdown signal
pub fn install_handler() -> Result<ShutdownSignal> {
    let signal = ShutdownSignal::new();
    let flag = signal.clone();

    ctrlc::set_handler(move || {
        if flag.is_triggered() {
            // Second interrupt while cleanup is running
            tracing::warn!("already shutting down");
            return;
        }
        tracing::warn!("received interrupt signal, cleaning up");
        flag.trigger();
    })
    .map_err(|e| BerthError::Io(std::io::Error::other(e.to_string())))?;

    Ok(signal)
}
