//! Cooperative cancellation.
//!
//! A `CancellationToken` is a shared flag that starts clear and is set at most once.
//! The pipeline controller polls it once per iteration; nothing is interrupted
//! mid-call, so shutdown latency is bounded by the current blocking operation.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Route SIGINT and SIGTERM (Ctrl-C / console close on Windows) to this token.
    ///
    /// Can only be installed once per process; a second call returns an error.
    pub fn install_signal_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if token.cancel() {
                log::info!("termination signal received, stopping pipeline");
            }
        })
        .context("install termination signal handler")
    }
}
