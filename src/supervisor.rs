//! The lifecycle controller (§4.1) and application control surface (§4.6): startup through
//! teardown, and the handle an embedding application uses to read and mutate the supervisor's
//! live state from its [`crate::app::JobSource`] hooks.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use tracing::{event, Level};

use crate::app::JobSource;
use crate::config::{ControlSignal, SupervisorConfig};
use crate::daemonize::Daemonizing;
use crate::dispatcher;
use crate::error::{ResultExt, Severity};
use crate::ipc::{IpcRegion, RunStatus};
use crate::lockfile::LockFile;
use crate::proctitle;
use crate::signals::SignalLatch;
use crate::slots::SlotTable;

/// The handle an embedding application shares with its [`Supervisor`] and reads/mutates from its
/// own code (including from inside `load_config`/`get_next_job`) to drive the operations of §4.6.
///
/// Before [`Supervisor::run`] has set up the IPC region, app-var and run-status operations are
/// configuration-only no-ops per §9's open question ("pre-init as configuration-only, post-init
/// as live") — there is nothing live to read or write yet. `max_workers`/`idle_sleep`/
/// `propagate_signals` live in the shared [`SupervisorConfig`] and work identically before and
/// after.
#[derive(Clone)]
pub struct ControlSurface {
    config: Arc<Mutex<SupervisorConfig>>,
    region: Arc<OnceLock<IpcRegion>>,
}

impl ControlSurface {
    fn new(config: SupervisorConfig) -> Self {
        ControlSurface {
            config: Arc::new(Mutex::new(config)),
            region: Arc::new(OnceLock::new()),
        }
    }

    fn bind_region(&self, region: IpcRegion) {
        // Set once, by the supervisor, right after IPC setup (§4.1 step 5); a second call (there
        // shouldn't be one) is silently ignored rather than panicking.
        let _ = self.region.set(region);
    }

    fn region(&self) -> Option<&IpcRegion> {
        self.region.get()
    }

    /// §4.6 `set_max_workers`: refused (prior value kept) if `n == 0`. Pre-init this just updates
    /// the stored config; post-init, the dispatcher reads the new ceiling off this same config on
    /// its next pass and grows/shrinks the slot table accordingly (§4.2 slot-table compaction).
    pub fn set_max_workers(&self, n: usize) -> bool {
        self.config.lock().unwrap().set_max_workers(n)
    }

    pub fn get_max_workers(&self) -> usize {
        self.config.lock().unwrap().max_workers()
    }

    pub fn set_idle_sleep(&self, us: u64) {
        self.config.lock().unwrap().set_idle_sleep(us)
    }

    pub fn idle_sleep_us(&self) -> u64 {
        self.config.lock().unwrap().idle_sleep_us()
    }

    pub fn set_propagate_signals(&self, on: bool) {
        self.config.lock().unwrap().set_propagate_signals(on)
    }

    pub fn propagate_signals(&self) -> bool {
        self.config.lock().unwrap().propagate_signals()
    }

    pub fn get_pid_file(&self) -> PathBuf {
        self.config.lock().unwrap().pid_file_path().to_path_buf()
    }

    /// §4.5 "app vars": stores `value` verbatim (the caller has already serialized anything
    /// composite). A no-op before the IPC region exists.
    pub fn set_app_var(&self, name: &str, value: &[u8], lock: bool) -> Result<()> {
        match self.region() {
            Some(region) => region.set_app_var(name, value, lock),
            None => Ok(()),
        }
    }

    pub fn get_app_var(&self, name: &str, lock: bool) -> Result<Option<Vec<u8>>> {
        match self.region() {
            Some(region) => region.get_app_var(name, lock),
            None => Ok(None),
        }
    }

    /// Pre-init always reports `Run`: there is no live run-status yet, and nothing has asked to
    /// terminate a supervisor that hasn't started.
    pub fn get_run_status(&self, lock: bool) -> Result<RunStatus> {
        match self.region() {
            Some(region) => with_optional_lock(region, lock, |r| r.run_status()),
            None => Ok(RunStatus::Run),
        }
    }

    /// §3: `run_status` is monotonic RUN → TERMINATE; pre-init this is a no-op since there's
    /// nothing backing it yet.
    pub fn set_run_status(&self, status: RunStatus, lock: bool) -> Result<()> {
        if let Some(region) = self.region() {
            with_optional_lock(region, lock, |r| r.set_run_status(status))?;
        }
        Ok(())
    }

    pub fn get_running_workers(&self, lock: bool) -> Result<u32> {
        match self.region() {
            Some(region) => with_optional_lock(region, lock, |r| r.active_count()),
            None => Ok(0),
        }
    }

    pub fn has_free_slot(&self, lock: bool) -> Result<bool> {
        Ok(self.get_running_workers(lock)? < self.get_max_workers() as u32)
    }

    fn ipc_size(&self) -> usize {
        self.config.lock().unwrap().ipc_size()
    }

    fn uid_to_run_as(&self) -> Option<u32> {
        self.config.lock().unwrap().uid_to_run_as()
    }

    fn detach(&self) -> bool {
        self.config.lock().unwrap().detach()
    }

    fn no_chdir(&self) -> bool {
        self.config.lock().unwrap().no_chdir()
    }

    fn handled_signals(&self) -> Vec<ControlSignal> {
        self.config.lock().unwrap().handled_signals().collect()
    }
}

fn with_optional_lock<T>(region: &IpcRegion, lock: bool, f: impl FnOnce(&IpcRegion) -> T) -> Result<T> {
    if lock {
        let _guard = region.lock()?;
        Ok(f(region))
    } else {
        Ok(f(region))
    }
}

/// The daemon supervisor (§1, §4). Construct with [`Supervisor::new`], hand a clone of
/// [`Supervisor::control`] to the embedding application if it wants to read/mutate state from its
/// own hooks, then call [`Supervisor::run`] with the application's [`JobSource`] implementation.
pub struct Supervisor {
    control: ControlSurface,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Supervisor {
            control: ControlSurface::new(config),
        }
    }

    /// A cloneable handle to this supervisor's control surface (§4.6), for the embedding
    /// application to hold onto and call from its own [`JobSource`] hooks or other code.
    pub fn control(&self) -> ControlSurface {
        self.control.clone()
    }

    /// Runs the full lifecycle (§4.1 startup, §4.2 dispatch loop, teardown) to completion. Does
    /// not return until the supervisor has cleanly shut down (or a startup step has failed).
    pub fn run<J: JobSource>(self, app: J) -> Result<()> {
        let pid_file_path = self.control.get_pid_file();

        // Step 1: lock-file acquisition.
        let lock = LockFile::acquire(&pid_file_path)?;

        // Step 2: daemonize (conditionally — §4.1 step 2's fork is unconditional on a true Unix
        // daemon, but this crate keeps the teacher's `--detach` toggle so the supervisor can be
        // driven and tested in the foreground without forking at all).
        let daemonizing = match unsafe { Daemonizing::start(self.control.detach(), self.control.no_chdir()) } {
            Ok(d) => d,
            Err(e) => {
                lock.remove();
                return Err(e);
            }
        };

        // Step 3: record identity.
        if let Err(e) = lock.record_pid(std::process::id() as libc::pid_t) {
            lock.remove();
            return Err(e);
        }

        // Step 4: optional effective-user switch.
        if let Some(uid) = self.control.uid_to_run_as() {
            if let Err(e) = switch_uid(&lock, uid) {
                lock.remove();
                return Err(e);
            }
        }

        // Step 5: IPC setup.
        let region = match IpcRegion::create(&pid_file_path, self.control.ipc_size()) {
            Ok(region) => region,
            Err(e) => {
                lock.remove();
                return Err(e);
            }
        };
        self.control.bind_region(region);

        proctitle::set("supervising 0 workers");
        daemonizing.finish();
        event!(Level::INFO, "supervisor started, pid {}", std::process::id());

        let result = self.run_inner(&app);

        // Teardown (§4.1): always runs once we reach here, success or failure, since the region
        // and lock file must not outlive this process either way.
        if let Some(region) = self.control.region() {
            region.destroy();
        }
        lock.remove();
        proctitle::restore();
        event!(Level::INFO, "supervisor teardown complete");

        result
    }

    fn run_inner<J: JobSource>(&self, app: &J) -> Result<()> {
        // Step 6: application init.
        app.load_config()
            .context("load_config failed at startup")
            .with_severity(Severity::StartupFatal)?;

        // Step 7: slot table init, using whatever max_workers load_config left behind.
        let mut slots = SlotTable::new(self.control.get_max_workers());

        // Step 8: install signal handlers.
        let handled = self.control.handled_signals();
        let latch = SignalLatch::install(&handled)?;

        let region = self
            .control
            .region()
            .expect("IPC region is bound before run_inner is called");

        dispatcher::run(region, &mut slots, &latch, &self.control, app)
    }
}

/// §4.1 step 4: changes ownership of the lock file to `uid`, then switches the process's
/// effective UID. Failure removes the lock file before returning, so a half-switched supervisor
/// never looks like the live instance to a later startup attempt.
fn switch_uid(lock: &LockFile, uid: u32) -> Result<()> {
    let current = unsafe { libc::geteuid() };
    if current == uid {
        return Ok(());
    }

    let path = CString::new(lock.path().as_os_str().as_bytes())
        .context("lock-file path contains a NUL byte")
        .with_severity(Severity::StartupFatal)?;
    let keep_group = -1i32 as libc::gid_t;
    if unsafe { libc::chown(path.as_ptr(), uid, keep_group) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("chown({}, {uid}) failed", lock.path().display()))
            .with_severity(Severity::StartupFatal);
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("setuid({uid}) failed"))
            .with_severity(Severity::StartupFatal);
    }
    Ok(())
}
