// src/signal.rs

//! Cooperative cancellation on SIGINT/SIGTERM
//!
//! The handlers only store the signal number into a shared atomic; all
//! teardown happens on the build thread, which polls the token between
//! steps and while waiting on a spawned process.

use crate::error::{Error, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    signal: Arc<AtomicUsize>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM into this token
    pub fn register(&self) -> Result<()> {
        for sig in [SIGINT, SIGTERM] {
            signal_hook::flag::register_usize(sig, Arc::clone(&self.signal), sig as usize)
                .map_err(|e| Error::IoError(format!("register handler for signal {}: {}", sig, e)))?;
        }
        debug!("Registered cancellation handlers");
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.load(Ordering::SeqCst) != 0
    }

    /// The signal that cancelled the build, if any
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig as i32),
        }
    }

    pub fn cancel(&self, sig: i32) {
        self.signal.store(sig.max(1) as usize, Ordering::SeqCst);
    }

    /// `Err(Cancelled)` once a signal has arrived
    pub fn check(&self) -> Result<()> {
        match self.signal() {
            Some(sig) => Err(Error::Cancelled(sig)),
            None => Ok(()),
        }
    }
}
