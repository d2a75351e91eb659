//! A minimal [`JobSource`] collaborator (§6): watches a directory and dispatches one worker per
//! file found there, deleting each file once its worker has picked it up.
//!
//! Grounded on the teacher crate's `examples/test-daemon.rs`: a small `clap`-flattened binary
//! that wires the supervisor's CLI args into its own `Args`, builds the supervisor, and runs it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use jobsupervisor::logging::{self, LogHandle};
use jobsupervisor::{JobSource, SlotHandle, Supervisor, SupervisorConfig};
use tracing::{event, Level};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    #[clap(flatten)]
    supervisor: jobsupervisor::config::SupervisorArgs,

    /// Directory to scan for files to "process".
    #[clap(long)]
    watch_dir: PathBuf,

    /// Log to this file instead of stderr, reopening it on each config reload (HUP) for
    /// logrotate-style rotation.
    #[clap(long)]
    log_file: Option<PathBuf>,
}

struct FileScanner {
    watch_dir: PathBuf,
    // `get_next_job` runs on the supervisor and `child_run` runs in a forked worker, so this
    // never actually needs cross-process synchronization; it exists only to make the directory
    // listing order deterministic across calls within the supervisor process.
    seen: Mutex<()>,
    log: LogHandle,
}

impl FileScanner {
    fn new(watch_dir: PathBuf, log: LogHandle) -> Self {
        FileScanner {
            watch_dir,
            seen: Mutex::new(()),
            log,
        }
    }

    fn next_pending_file(&self) -> Option<PathBuf> {
        let _guard = self.seen.lock().unwrap();
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.watch_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();
        entries.into_iter().next()
    }
}

impl JobSource for FileScanner {
    type Job = PathBuf;

    fn load_config(&self) -> Result<()> {
        self.log.reopen().context("failed to reopen log file on reload")?;
        event!(Level::INFO, "scanning {}", self.watch_dir.display());
        Ok(())
    }

    fn get_next_job(&self, _slot: &SlotHandle) -> Result<Option<PathBuf>> {
        Ok(self.next_pending_file())
    }

    fn child_run(&self, job: PathBuf, slot: &SlotHandle) -> i32 {
        event!(Level::INFO, "slot {}: processing {}", slot.index(), job.display());
        match process_file(&job) {
            Ok(()) => 0,
            Err(e) => {
                event!(Level::ERROR, "slot {}: {} failed: {e}", slot.index(), job.display());
                1
            }
        }
    }
}

/// Stands in for whatever real per-job work an embedder would do; here, just counts lines and
/// removes the file so it isn't picked up again.
fn process_file(path: &Path) -> Result<()> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("{}: read failed", path.display()))?;
    event!(Level::DEBUG, "{}: {} lines", path.display(), contents.lines().count());
    fs::remove_file(path).with_context(|| format!("{}: remove failed", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log = match &args.log_file {
        Some(path) => logging::init_file(path).context("failed to open log file")?,
        None => logging::init_stderr(),
    };

    if !args.watch_dir.is_dir() {
        anyhow::bail!("{}: not a directory", args.watch_dir.display());
    }

    let config = SupervisorConfig::from_args(&args.supervisor);
    let supervisor = Supervisor::new(config);
    let app = FileScanner::new(args.watch_dir, log);
    supervisor.run(app)
}
