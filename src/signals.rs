//! Signal intake (§4.4): an asynchronous receiver that records the most recently delivered
//! control signal in a single-slot latch and does nothing else in signal context.
//!
//! Grounded on the teacher crate's `cleanup::SignalHandler`, which runs a `signal_hook::Signals`
//! iterator on a dedicated thread rather than installing a libc signal handler directly — this
//! sidesteps async-signal-safety concerns entirely, since the thread can allocate, log, and take
//! locks freely. This spec's latch is narrower than the teacher's action registry: it holds
//! exactly one pending signal (bursts collapse, §4.4), and `terminating`/`run_status` are only
//! ever *acted on* by the dispatcher thread that drains the latch, never written from the signal
//! thread itself.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use signal_hook::iterator::Signals;

use crate::config::ControlSignal;

const NONE: i32 = 0;

/// Single-slot store for the most recently received control signal.
#[derive(Clone)]
pub struct SignalLatch {
    last: Arc<AtomicI32>,
}

impl SignalLatch {
    /// Spawns the signal-intake thread, listening for exactly the signals in `handled`.
    pub fn install(handled: &[ControlSignal]) -> Result<Self> {
        let raws: Vec<libc::c_int> = handled.iter().map(|s| s.as_raw()).collect();
        let mut signals = Signals::new(&raws).context("installing signal handlers")?;
        let last = Arc::new(AtomicI32::new(NONE));
        let last_for_thread = last.clone();

        thread::Builder::new()
            .name("signal-intake".into())
            .spawn(move || {
                for signal in signals.forever() {
                    // Only ever write the raw signal number. No locking, no application logic:
                    // everything else happens on the dispatcher thread that drains this latch.
                    last_for_thread.store(signal, Ordering::SeqCst);
                }
            })
            .context("spawning signal-intake thread")?;

        Ok(SignalLatch { last })
    }

    /// Returns and clears the pending signal, if any (§4.4: "after processing, the latch is
    /// cleared to null").
    pub fn take(&self) -> Option<ControlSignal> {
        let raw = self.last.swap(NONE, Ordering::SeqCst);
        if raw == NONE {
            None
        } else {
            ControlSignal::from_raw(raw)
        }
    }

    /// True if a signal is currently latched, without consuming it.
    pub fn is_pending(&self) -> bool {
        self.last.load(Ordering::SeqCst) != NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32 as Raw;

    #[test]
    fn latch_collapses_bursts_to_the_most_recent_signal() {
        // Exercises the same compare-and-swap the real latch uses, without needing to actually
        // deliver OS signals in a unit test.
        let last = Raw::new(NONE);
        last.store(ControlSignal::Hup.as_raw(), Ordering::SeqCst);
        last.store(ControlSignal::Term.as_raw(), Ordering::SeqCst);
        let raw = last.swap(NONE, Ordering::SeqCst);
        assert_eq!(ControlSignal::from_raw(raw), Some(ControlSignal::Term));
    }
}
