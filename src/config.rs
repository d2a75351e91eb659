//! Supervisor configuration, tunable before `run()` and (partially) at runtime.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;

/// The minimum idle sleep the dispatcher will honor (§8 boundary behavior).
pub const MIN_IDLE_SLEEP_US: u64 = 100;

/// Recognized control signals (§4.4). `Term` and `Quit` both mean "terminate gracefully".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    Term,
    Quit,
    Hup,
}

impl ControlSignal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            ControlSignal::Term => signal_hook::consts::SIGTERM,
            ControlSignal::Quit => signal_hook::consts::SIGQUIT,
            ControlSignal::Hup => signal_hook::consts::SIGHUP,
        }
    }

    pub fn from_raw(raw: libc::c_int) -> Option<Self> {
        match raw {
            x if x == signal_hook::consts::SIGTERM => Some(ControlSignal::Term),
            x if x == signal_hook::consts::SIGQUIT => Some(ControlSignal::Quit),
            x if x == signal_hook::consts::SIGHUP => Some(ControlSignal::Hup),
            _ => None,
        }
    }
}

/// Command-line-ergonomic configuration, meant to be `#[clap(flatten)]`d into an embedding
/// binary's own `Args`, the same way the teacher's `Daemonize` is flattened by its callers.
#[derive(Clone, Debug, Parser, PartialEq, Eq)]
pub struct SupervisorArgs {
    /// Path to the lock file enforcing single-instance semantics.
    #[clap(long)]
    pub pid_file: Option<PathBuf>,

    /// Maximum number of concurrently running worker processes.
    #[clap(long)]
    pub max_workers: Option<usize>,

    /// Microseconds to sleep after `get_next_job` returns nothing.
    #[clap(long)]
    pub idle_sleep_us: Option<u64>,

    /// Relay received TERM/QUIT/HUP signals to running workers.
    #[clap(long)]
    pub propagate_signals: bool,

    /// Effective UID to switch to after daemonizing.
    #[clap(long)]
    pub uid: Option<u32>,

    /// Detach from the controlling terminal and run in the background (§4.1 step 2). Off by
    /// default so the supervisor can be driven directly (and tested) in the foreground, the same
    /// way the teacher's own `--detach` flag defaults to off.
    #[clap(long)]
    pub detach: bool,

    /// When detaching, skip changing the working directory to `/`.
    #[clap(long)]
    pub no_chdir: bool,
}

/// Full supervisor configuration (§3 `SupervisorConfig` entity).
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub(crate) max_workers: usize,
    pub(crate) idle_sleep_us: u64,
    pub(crate) no_slot_sleep_us: u64,
    pub(crate) propagate_signals: bool,
    pub(crate) handled_signals: HashSet<ControlSignal>,
    pub(crate) uid_to_run_as: Option<u32>,
    pub(crate) pid_file_path: PathBuf,
    pub(crate) ipc_size: Option<usize>,
    pub(crate) detach: bool,
    pub(crate) no_chdir: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            max_workers: 1,
            idle_sleep_us: 250_000,
            no_slot_sleep_us: 100,
            propagate_signals: false,
            handled_signals: [ControlSignal::Term, ControlSignal::Quit, ControlSignal::Hup]
                .into_iter()
                .collect(),
            uid_to_run_as: None,
            pid_file_path: PathBuf::from("/var/run/jobsupervisor.pid"),
            ipc_size: None,
            detach: false,
            no_chdir: false,
        }
    }
}

impl SupervisorConfig {
    pub fn new(pid_file_path: impl Into<PathBuf>) -> Self {
        SupervisorConfig {
            pid_file_path: pid_file_path.into(),
            ..Default::default()
        }
    }

    /// Builds a config from parsed CLI args, falling back to defaults for anything unset.
    pub fn from_args(args: &SupervisorArgs) -> Self {
        let mut config = SupervisorConfig::default();
        if let Some(ref path) = args.pid_file {
            config.pid_file_path = path.clone();
        }
        if let Some(n) = args.max_workers {
            let _ = config.set_max_workers(n);
        }
        if let Some(us) = args.idle_sleep_us {
            config.set_idle_sleep(us);
        }
        config.propagate_signals = args.propagate_signals;
        config.uid_to_run_as = args.uid;
        config.detach = args.detach;
        config.no_chdir = args.no_chdir;
        config
    }

    /// §4.6 `set_max_workers`: `n` must be at least 1 and at most [`crate::ipc::MAX_SLOTS`] (the
    /// IPC region's slot array is a fixed-size `repr(C)` array, not a growable collection); out
    /// of that range the call is refused and the prior value kept.
    pub fn set_max_workers(&mut self, n: usize) -> bool {
        if n == 0 || n > crate::ipc::MAX_SLOTS {
            return false;
        }
        self.max_workers = n;
        true
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// §8 boundary behavior: `set_idle_sleep(0)` stores the 100 µs floor.
    pub fn set_idle_sleep(&mut self, us: u64) {
        self.idle_sleep_us = us.max(MIN_IDLE_SLEEP_US);
    }

    pub fn idle_sleep_us(&self) -> u64 {
        self.idle_sleep_us
    }

    pub fn set_propagate_signals(&mut self, on: bool) {
        self.propagate_signals = on;
    }

    pub fn propagate_signals(&self) -> bool {
        self.propagate_signals
    }

    pub fn pid_file_path(&self) -> &std::path::Path {
        &self.pid_file_path
    }

    pub fn ipc_size(&self) -> usize {
        self.ipc_size.unwrap_or(crate::ipc::DEFAULT_IPC_SIZE)
    }

    pub fn with_ipc_size(mut self, size: usize) -> Self {
        self.ipc_size = Some(size);
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid_to_run_as = Some(uid);
        self
    }

    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn uid_to_run_as(&self) -> Option<u32> {
        self.uid_to_run_as
    }

    pub fn detach(&self) -> bool {
        self.detach
    }

    pub fn no_chdir(&self) -> bool {
        self.no_chdir
    }

    pub fn handled_signals(&self) -> impl Iterator<Item = ControlSignal> + '_ {
        self.handled_signals.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_max_workers_rejects_zero() {
        let mut config = SupervisorConfig::new("/tmp/x.pid");
        config.set_max_workers(4);
        assert!(!config.set_max_workers(0));
        assert_eq!(config.max_workers(), 4);
    }

    #[test]
    fn set_max_workers_rejects_above_slot_table_capacity() {
        let mut config = SupervisorConfig::new("/tmp/x.pid");
        config.set_max_workers(4);
        assert!(!config.set_max_workers(crate::ipc::MAX_SLOTS + 1));
        assert_eq!(config.max_workers(), 4);
        assert!(config.set_max_workers(crate::ipc::MAX_SLOTS));
        assert_eq!(config.max_workers(), crate::ipc::MAX_SLOTS);
    }

    #[test]
    fn set_idle_sleep_clamps_to_floor() {
        let mut config = SupervisorConfig::new("/tmp/x.pid");
        config.set_idle_sleep(0);
        assert_eq!(config.idle_sleep_us(), MIN_IDLE_SLEEP_US);
    }

    #[test]
    fn idempotent_round_trip() {
        let mut config = SupervisorConfig::new("/tmp/x.pid");
        config.set_max_workers(7);
        assert_eq!(config.max_workers(), 7);
    }
}
