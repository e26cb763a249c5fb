/// # Signals
///
/// Provides a simple way for both registering termination signal handlers and
/// notifying terminations to the polling loop.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;

#[derive(Clone)]
pub(crate) struct Running(Arc<AtomicBool>);

impl Running {
    pub(crate) fn new() -> Running {
        Running(Arc::new(AtomicBool::new(false)))
    }

    /// Register termination signals so the current Running instance will stop
    /// upon receiving one of those signals (SIGINT, SIGTERM, etc).
    pub(crate) fn register_term_signals(&self) -> Result<()> {
        for signal in signal_hook::consts::TERM_SIGNALS {
            signal_hook::flag::register(*signal, Arc::clone(&self.0))?;
        }
        Ok(())
    }

    pub(crate) fn running(&self) -> bool {
        !self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Default for Running {
    fn default() -> Self {
        Running::new()
    }
}
