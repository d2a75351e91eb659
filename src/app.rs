//! The embedding contract (§6, §9): the three hooks a host application implements to describe
//! what jobs to run and how to run them.

use anyhow::Result;

use crate::slots::SlotHandle;

/// A host application's job source and runner.
///
/// Only [`JobSource::get_next_job`] and [`JobSource::child_run`] are mandatory;
/// [`JobSource::load_config`] defaults to a no-op so a minimal embedder (like `demos/file_scanner`)
/// doesn't have to think about reload semantics at all.
pub trait JobSource: Send + Sync {
    /// Opaque job metadata produced by [`JobSource::get_next_job`] and handed unchanged to
    /// [`JobSource::child_run`]. Carried across the `fork()` boundary by value, not by reference,
    /// since the worker is a distinct process image.
    type Job: Send;

    /// Called by the supervisor at startup and again on every HUP (§4.4). May mutate the
    /// application's own control surface (for example, raising `max_workers`); must return
    /// promptly, since the dispatcher does not poll for new jobs while this runs.
    fn load_config(&self) -> Result<()> {
        Ok(())
    }

    /// Called by the supervisor, on its own process, immediately before it would fork a worker
    /// for `slot`. Returns `Ok(None)` if there is no job ready yet — indistinguishable, by design
    /// (§9), from any other "nothing to do" outcome. An `Err` here is treated as graceful-shutdown
    /// trigger (§7), not a crash: the supervisor stops dispatching and drains existing workers.
    fn get_next_job(&self, slot: &SlotHandle) -> Result<Option<Self::Job>>;

    /// Called by the worker, on its own freshly forked process, to actually run `job`. The
    /// returned code becomes the worker's exit code. A panic here is caught by the worker runtime
    /// and turned into exit code `-1` (§4.3); `child_run` itself need not catch anything.
    fn child_run(&self, job: Self::Job, slot: &SlotHandle) -> i32;
}
