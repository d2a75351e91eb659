//! The worker runtime (§4.3): the code path taken only in a freshly forked worker process.

use std::panic::{catch_unwind, AssertUnwindSafe};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use tracing::{event, Level};

use crate::app::JobSource;
use crate::ipc::IpcRegion;
use crate::logging::DAEMON_TARGET;
use crate::slots::{SlotHandle, SlotTable};

/// Runs `job` to completion and exits. Never returns: every path through this function ends in
/// `std::process::exit` or an uncatchable self-kill (§4.3 orphan suicide).
///
/// Called immediately after `fork()` returns `0`, while the dispatcher is still mid-iteration on
/// the parent side; `region` and `slots` are this process's own copies of the supervisor's
/// mapping (shared memory for `region`, an ordinary private copy for `slots`).
pub fn run<J: JobSource>(region: &IpcRegion, slots: &mut SlotTable, slot: &SlotHandle, job: J::Job, app: &J) -> ! {
    // Drop the inherited copy of the supervisor's local pid map before doing anything else: it
    // reflects the supervisor's bookkeeping at the instant of fork, not this process's own
    // identity, and acting on it here would be a bug waiting to happen.
    slots.clear_local();

    let code = match catch_unwind(AssertUnwindSafe(|| app.child_run(job, slot))) {
        Ok(code) => code,
        Err(panic) => {
            event!(Level::ERROR, "child_run panicked in slot {}: {}", slot.index(), panic_message(&panic));
            -1
        }
    };

    if is_orphaned() {
        // The supervisor that forked this worker is gone. A replacement supervisor may have
        // already recreated the IPC region at the same key; touching it here would corrupt state
        // that belongs to a completely different instance (§4.3, §9). Self-terminate without
        // going anywhere near `region`.
        event!(
            Level::WARN,
            target: DAEMON_TARGET,
            "worker pid {} orphaned (parent is init), self-terminating without releasing slot {}",
            std::process::id(),
            slot.index()
        );
        let _ = kill(Pid::this(), Signal::SIGKILL);
        // SIGKILL cannot be caught or ignored; reaching here would mean the kernel refused to
        // deliver it, which shouldn't happen. Exit nonzero as a fallback rather than fall through
        // to the normal-exit path below.
        std::process::exit(1);
    }

    // Normal exit (§4.3): release the slot and report our result. If the mutex can't be
    // acquired, skip the writes rather than touch them unguarded; the supervisor's reap path
    // already releases slots left behind by workers that exit without this handshake.
    match region.lock() {
        Ok(guard) => {
            region.set_slot_occupied(slot.index(), false);
            region.decrement_active_count();
            drop(guard);
        }
        Err(e) => {
            event!(
                Level::ERROR,
                "slot {}: failed to acquire IPC mutex while releasing, leaving it for reap: {e}",
                slot.index()
            );
        }
    }

    std::process::exit(code);
}

fn is_orphaned() -> bool {
    getppid() == Pid::from_raw(1)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
