//! Lock-file acquisition and teardown (§4.1 step 1, §3 `LockFile` entity).
//!
//! Ported from the teacher crate's `make_pidfile`/`read_pidfile`/`check_already_running`, but
//! simplified to the probe-then-create dance this spec calls for rather than the teacher's
//! `fcntl(F_SETLK)` lock-file dance: read the pid, `kill(pid, 0)` it, and treat "no such
//! process" as stale. The supervisor owns this file exclusively; workers must never touch it
//! (§5).

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{event, Level};

use crate::error::{ResultExt, Severity};

/// An acquired lock file. Dropping it does *not* remove the file — removal is an explicit step
/// of clean teardown (§4.1), since a crash should leave the file behind for the next startup's
/// staleness probe to find.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock file at `path`, refusing to proceed if a live process already owns it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(owner_pid) = read_live_owner(path)? {
            eprintln!(
                "{}: already running as pid {owner_pid}, aborting",
                path.display()
            );
            return Err(anyhow!("{}: already running as pid {owner_pid}", path.display()))
                .with_severity(Severity::StartupFatal);
        }

        create_empty(path).with_severity(Severity::StartupFatal)?;
        Ok(LockFile {
            path: path.to_path_buf(),
        })
    }

    /// Writes `pid` into the lock file, truncating first (§4.1 step 3). Called once the daemon
    /// process knows its final pid (i.e. after the daemonizing fork, if any).
    pub fn record_pid(&self, pid: libc::pid_t) -> Result<()> {
        let mut file = File::create(&self.path)
            .with_context(|| format!("{}: truncate failed", self.path.display()))
            .with_severity(Severity::StartupFatal)?;
        file.write_all(format!("{pid}").as_bytes())
            .with_context(|| format!("{}: write failed", self.path.display()))
            .with_severity(Severity::StartupFatal)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file. Last step of clean teardown (§4.1).
    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                event!(Level::WARN, "{}: removing lock file failed ({e})", self.path.display());
            }
        }
    }
}

fn create_empty(path: &Path) -> Result<()> {
    File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("{}: create failed", path.display()))?;
    Ok(())
}

/// Returns `Some(pid)` if `path` names a live process, `None` if the file is absent or stale
/// (in which case the stale file is removed).
fn read_live_owner(path: &Path) -> Result<Option<libc::pid_t>> {
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("{}: read failed", path.display())),
    };

    let pid: libc::pid_t = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            // Unreadable contents: treat like a stale file so startup can proceed.
            event!(Level::WARN, "{}: pidfile contents are not a pid, removing", path.display());
            fs::remove_file(path).ok();
            return Ok(None);
        }
    };

    match probe(pid) {
        ProbeResult::Alive => Ok(Some(pid)),
        ProbeResult::Dead => {
            event!(Level::INFO, "{}: stale pidfile for pid {pid}, removing", path.display());
            fs::remove_file(path)
                .with_context(|| format!("{}: failed to delete stale pidfile", path.display()))?;
            Ok(None)
        }
    }
}

enum ProbeResult {
    Alive,
    Dead,
}

/// Probes `pid` with a no-op signal. Permission-denied is treated as "alive" (§4.1 step 1): we
/// can't prove the process is gone, and clobbering someone else's live process is worse than a
/// false positive.
fn probe(pid: libc::pid_t) -> ProbeResult {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return ProbeResult::Alive;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => ProbeResult::Alive,
        Some(libc::ESRCH) => ProbeResult::Dead,
        _ => ProbeResult::Dead,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_file_and_records_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pid");
        let lock = LockFile::acquire(&path).unwrap();
        lock.record_pid(std::process::id() as libc::pid_t).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        lock.remove();
        assert!(!path.exists());
    }

    #[test]
    fn stale_pidfile_is_removed_and_acquisition_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        // pid 2^30-ish is extremely unlikely to be a live process.
        fs::write(&path, "999999").unwrap();
        let lock = LockFile::acquire(&path).unwrap();
        lock.remove();
    }

    #[test]
    fn live_owner_refuses_acquisition() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.pid");
        fs::write(&path, std::process::id().to_string()).unwrap();
        let err = LockFile::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
        fs::remove_file(&path).unwrap();
    }
}
