//! The dispatcher loop (§4.2): the scheduler state machine that reaps finished workers, services
//! signals, waits for a free slot, asks the application for the next job, forks a worker, and
//! tracks its slot. Runs single-threaded in the supervisor process.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{event, Level};

use crate::app::JobSource;
use crate::config::ControlSignal;
use crate::error::{ResultExt, Severity};
use crate::ipc::{IpcRegion, RunStatus};
use crate::logging::{self, LogLevel};
use crate::signals::SignalLatch;
use crate::slots::SlotTable;
use crate::supervisor::ControlSurface;
use crate::worker;

/// The settling pause after a successful fork (§4.2): lets a rapidly-exiting worker become
/// reapable before the next loop pass touches it.
const SETTLE_AFTER_FORK: Duration = Duration::from_micros(20);
/// Poll granularity while blocked waiting for a free slot or a worker exit (§4.2, §5).
const WAIT_POLL: Duration = Duration::from_micros(100);
/// Gap between signal-relay retry attempts (§4.4, §7 "Transient").
const SIGNAL_RETRY_GAP: Duration = Duration::from_millis(1);

/// Runs the dispatch loop to completion. Returns once a clean shutdown has drained every worker;
/// propagates loop-fatal errors (mutex or reap failures other than "no children") so the caller
/// can still run teardown.
pub fn run<J: JobSource>(
    region: &IpcRegion,
    slots: &mut SlotTable,
    latch: &SignalLatch,
    control: &ControlSurface,
    app: &J,
) -> Result<()> {
    let mut terminating = false;

    loop {
        let pending_signal = {
            let _guard = region.lock()?;
            reap_finished_workers(region, slots)?;
            latch.take()
        };

        if let Some(sig) = pending_signal {
            handle_signal(sig, region, slots, control, app, &mut terminating);
        }

        // Pick up any change to max_workers (from load_config, HUP reload, or the app calling
        // the control surface directly) before deciding whether a slot is free.
        slots.set_max_workers(control.get_max_workers());

        if terminating {
            {
                let _guard = region.lock()?;
                region.set_run_status(RunStatus::Terminate);
            }
            event!(Level::INFO, "draining workers before shutdown");
            wait_all_workers(region, slots)?;
            return Ok(());
        }

        // A signal was processed this pass: per §4.2/§4.4, this always causes at least one extra
        // full loop pass before the next fork, so re-check from the top rather than dispatch now.
        if pending_signal.is_some() {
            continue;
        }

        let slot = {
            let _guard = region.lock()?;
            match slots.assign(region) {
                Some(slot) => {
                    region.increment_active_count();
                    Some(slot)
                }
                None => None,
            }
        };

        let slot = match slot {
            Some(slot) => slot,
            None => {
                block_until_slot_or_signal(region, slots, latch)?;
                continue;
            }
        };

        match app.get_next_job(&slot) {
            Ok(Some(job)) => match unsafe { libc::fork() } {
                -1 => {
                    event!(Level::ERROR, "fork() failed: {}", std::io::Error::last_os_error());
                    terminating = true;
                    release_slot(region, slots, slot.index())?;
                }
                0 => {
                    worker::run(region, slots, &slot, job, app);
                    unreachable!("worker::run never returns");
                }
                pid => {
                    slots.record_pid(&slot, pid);
                    logging::log(
                        LogLevel::Daemon,
                        &format!("forked worker pid {pid} into slot {}, settling {SETTLE_AFTER_FORK:?}", slot.index()),
                    );
                    thread::sleep(SETTLE_AFTER_FORK);
                }
            },
            Ok(None) => {
                release_slot(region, slots, slot.index())?;
                if !terminating {
                    thread::sleep(Duration::from_micros(control.idle_sleep_us()));
                }
            }
            Err(e) => {
                event!(Level::ERROR, "get_next_job failed, shutting down gracefully: {e}");
                terminating = true;
                release_slot(region, slots, slot.index())?;
            }
        }
    }
}

/// Drains every currently-finished worker without blocking (§4.2 "reap_finished_workers(false)").
/// Caller must hold `region`'s mutex. A worker that exited after already releasing its own slot
/// (§4.3 normal exit) just has its stale local pid entry dropped; a worker that died without
/// releasing (crashed, or killed by an uncaught signal) has its slot released here on its behalf.
fn reap_finished_workers(region: &IpcRegion, slots: &mut SlotTable) -> Result<usize> {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    record_worker_exit(region, slots, pid.as_raw(), &status);
                }
                reaped += 1;
            }
            Err(nix::errno::Errno::ECHILD) => break, // benign (§4.2): nothing left to reap.
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).with_severity(Severity::LoopFatal),
        }
    }
    Ok(reaped)
}

fn record_worker_exit(region: &IpcRegion, slots: &mut SlotTable, pid: libc::pid_t, status: &WaitStatus) {
    let Some(index) = slots.index_for_pid(pid) else {
        // Not a pid this supervisor was tracking (already compacted away, or a grandchild we
        // otherwise don't care about); nothing to release.
        return;
    };

    if region.slot_occupied(index) {
        // The worker died before reaching its own normal-exit release (§4.3): crash, or an
        // uncaught signal. Release on its behalf so the slot doesn't leak.
        event!(
            Level::WARN,
            "worker pid {pid} in slot {index} exited ({status:?}) without releasing its slot"
        );
        region.decrement_active_count();
        slots.release(region, index);
    } else {
        // Released cleanly already; just drop the stale local bookkeeping.
        slots.clear_pid(index);
    }
}

/// §4.2 "blocking_wait_for_worker_exit_or_signal": blocks until either a worker exits or a signal
/// is latched, polling every 100µs, without holding the mutex between polls.
fn block_until_slot_or_signal(region: &IpcRegion, slots: &mut SlotTable, latch: &SignalLatch) -> Result<()> {
    loop {
        if latch.is_pending() {
            return Ok(());
        }
        let reaped = {
            let _guard = region.lock()?;
            reap_finished_workers(region, slots)?
        };
        if reaped > 0 {
            return Ok(());
        }
        thread::sleep(WAIT_POLL);
    }
}

/// The terminal "wait for all workers" phase (§4.2): blocks indefinitely (no forced timeout, §5)
/// until every outstanding worker — including ones past a since-shrunk `max_workers` ceiling
/// (§4.2 slot-table compaction) — has exited.
fn wait_all_workers(region: &IpcRegion, slots: &mut SlotTable) -> Result<()> {
    loop {
        let still_running = {
            let _guard = region.lock()?;
            reap_finished_workers(region, slots)?;
            slots.any_pids_outstanding()
        };
        if !still_running {
            return Ok(());
        }
        thread::sleep(WAIT_POLL);
    }
}

fn release_slot(region: &IpcRegion, slots: &mut SlotTable, index: usize) -> Result<()> {
    let _guard = region.lock()?;
    region.decrement_active_count();
    slots.release(region, index);
    Ok(())
}

/// §4.4 processing semantics. Acts on `terminating` and calls application hooks outside the IPC
/// mutex (the caller has already dropped its guard by the time this runs).
fn handle_signal<J: JobSource>(
    sig: ControlSignal,
    _region: &IpcRegion,
    slots: &SlotTable,
    control: &ControlSurface,
    app: &J,
    terminating: &mut bool,
) {
    match sig {
        ControlSignal::Term | ControlSignal::Quit => {
            event!(Level::INFO, "received {sig:?}, beginning graceful shutdown");
            *terminating = true;
            if control.propagate_signals() {
                propagate_to_workers(slots, sig.as_raw());
            }
        }
        ControlSignal::Hup => {
            event!(Level::INFO, "received HUP, reloading configuration");
            if let Err(e) = app.load_config() {
                event!(Level::WARN, "load_config on HUP reload failed: {e}");
            }
            if control.propagate_signals() {
                propagate_to_workers(slots, sig.as_raw());
            }
        }
    }
}

/// Relays `raw_signal` to every worker pid the supervisor currently knows about, up to two
/// attempts each with a 1ms gap on failure (§4.4, §7 "Transient"); a worker that still can't be
/// reached after that is logged and left for the next reap pass.
fn propagate_to_workers(slots: &SlotTable, raw_signal: libc::c_int) {
    use nix::sys::signal::{kill, Signal};

    let Ok(signal) = Signal::try_from(raw_signal) else {
        return;
    };

    for pid in slots.occupied_pids().collect::<Vec<_>>() {
        let target = Pid::from_raw(pid);
        let mut delivered = false;
        for attempt in 0..2 {
            if kill(target, signal).is_ok() {
                delivered = true;
                break;
            }
            if attempt == 0 {
                thread::sleep(SIGNAL_RETRY_GAP);
            }
        }
        if !delivered {
            event!(Level::WARN, "could not relay {signal:?} to worker pid {pid}, giving up on it");
        }
    }
}
