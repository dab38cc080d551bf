//! Operator interrupt flag
//!
//! SIGINT and SIGTERM set a process-wide atomic that the session loop polls.
//! The handler only stores to the atomic.

use anyhow::{Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::debug;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Handle to the installed interrupt handlers
#[derive(Debug, Clone, Copy)]
pub struct InterruptFlag;

impl InterruptFlag {
    /// Install handlers for SIGINT and SIGTERM
    ///
    /// Call before spawning the tracer thread.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGINT, &action)
                .context("Failed to install SIGINT handler")?;
            signal::sigaction(Signal::SIGTERM, &action)
                .context("Failed to install SIGTERM handler")?;
        }

        debug!("interrupt handlers installed (SIGINT, SIGTERM)");
        Ok(Self)
    }

    pub fn is_set(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }

    /// Signal number that set the flag, 0 if none
    pub fn signal(&self) -> i32 {
        LAST_SIGNAL.load(Ordering::SeqCst)
    }

    /// Set the flag without a signal
    pub fn raise(&self) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        INTERRUPTED.store(false, Ordering::SeqCst);
        LAST_SIGNAL.store(0, Ordering::SeqCst);
    }
}

extern "C" fn on_signal(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
    INTERRUPTED.store(true, Ordering::SeqCst);
}
