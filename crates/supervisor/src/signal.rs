//! Shutdown signalling: a process-wide flag wired to SIGINT and SIGTERM,
//! and per-session stop flags so one session can wind down without taking
//! its siblings with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

/// Installs the SIGINT/SIGTERM handlers that set the shutdown flag.
pub fn install_handlers() -> std::io::Result<()> {
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe; the sigaction struct is zero-initialized per the
    // libc contract.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = mark_shutdown as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &raw const action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Whether a termination signal has been observed.
#[must_use]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

/// Sets the flag directly, for orderly teardown paths that are not
/// signal-driven.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

/// Cancellation token scoped to one session.
///
/// Every loop belonging to the session polls [`StopFlag::should_stop`],
/// which also folds in the process-wide signal flag.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Creates an unraised flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag for this session.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether this session was asked to stop.
    #[must_use]
    pub fn raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Whether this session or the whole process should wind down.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.raised() || shutdown_requested()
    }
}
