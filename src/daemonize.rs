//! Detaching from the controlling terminal (§4.1 step 2).
//!
//! Grounded on the teacher crate's `Daemonize`/`Daemonizing`: a `fork()` synchronized through a
//! notify pipe, so the parent can block until the child either reports successful startup (and
//! the parent exits 0) or dies before doing so (and the parent propagates the child's exit
//! code). The teacher's self-monitor/auto-restart-on-crash feature has no counterpart in this
//! spec — the supervisor already monitors its *workers*, so monitoring the supervisor itself
//! would be a different system — and is not carried over.

use std::ffi::CString;
use std::fs::File;
use std::io::prelude::*;
use std::io::{Error, ErrorKind};
use std::os::unix::prelude::*;
use std::process::exit;

use anyhow::Result;
use tracing::{event, Level};

use crate::error::{ResultExt, Severity};

/// A daemonization in progress. Call [`Daemonizing::finish`] once startup has fully succeeded to
/// let the original foreground process exit 0.
pub struct Daemonizing {
    detach: bool,
    no_chdir: bool,
    notify_pipe: Option<File>,
}

impl Daemonizing {
    /// Forks if `detach` is set. The parent blocks waiting for [`Daemonizing::finish`] to be
    /// called in the child (or for the child to die first, in which case the parent exits with
    /// the child's status).
    ///
    /// # Safety
    /// Must be called as early as possible, before any additional threads start: `fork()` only
    /// carries the calling thread into the child.
    pub unsafe fn start(detach: bool, no_chdir: bool) -> Result<Self> {
        assert_single_threaded();

        let notify_pipe = if detach {
            match fork_and_wait_for_startup()? {
                ForkOutcome::Parent { child_pid: _ } => {
                    // The child already reported success by the time fork_and_wait_for_startup
                    // returns `Parent`; nothing left to do but exit cleanly.
                    exit(0);
                }
                ForkOutcome::Child { notify_pipe } => Some(notify_pipe),
            }
        } else {
            None
        };

        if detach {
            libc::setsid();
        }

        Ok(Daemonizing {
            detach,
            no_chdir,
            notify_pipe,
        })
    }

    /// Completes daemonization: changes directory, closes standard fds, and signals the parent
    /// that startup succeeded.
    pub fn finish(mut self) {
        if self.detach {
            if !self.no_chdir {
                let _ = std::env::set_current_dir("/");
            }
            close_standard_fds();
        }
        if let Some(ref mut pipe) = self.notify_pipe {
            notify_startup(pipe);
        }
    }
}

enum ForkOutcome {
    Parent { child_pid: libc::pid_t },
    Child { notify_pipe: File },
}

fn fork_and_wait_for_startup() -> Result<ForkOutcome> {
    let (rfd, wfd) = sys::pipe().with_severity(Severity::StartupFatal)?;

    match unsafe { sys::fork() }.with_severity(Severity::StartupFatal)? {
        Some(child_pid) => {
            drop(wfd);
            let mut buf = [0u8; 1];
            let mut rfile = File::from(rfd);
            match rfile.read_exact(&mut buf) {
                Ok(_) => Ok(ForkOutcome::Parent { child_pid }),
                Err(_) => {
                    let (_, status) = sys::waitpid(child_pid).with_severity(Severity::StartupFatal)?;
                    event!(Level::ERROR, "fork child died before signaling startup ({status})");
                    let code = status.code().unwrap_or(1).max(1);
                    exit(code);
                }
            }
        }
        None => {
            drop(rfd);
            Ok(ForkOutcome::Child {
                notify_pipe: File::from(wfd),
            })
        }
    }
}

fn notify_startup(pipe: &mut File) {
    if let Err(e) = pipe.write_all(&[0u8; 1]) {
        event!(Level::ERROR, "pipe write failed ({e})");
        exit(1);
    }
}

fn close_standard_fds() {
    let dev_null = CString::new("/dev/null").unwrap();
    let null_fd = unsafe { libc::open(dev_null.as_ptr(), libc::O_RDWR) };
    if null_fd < 0 {
        event!(Level::ERROR, "could not open /dev/null ({})", Error::last_os_error());
        exit(1);
    }
    for fd in 0..=2 {
        unsafe {
            libc::dup2(null_fd, fd);
        }
    }
    unsafe {
        libc::close(null_fd);
    }
}

#[cfg(target_os = "linux")]
fn assert_single_threaded() {
    let count = std::fs::read_dir(format!("/proc/{}/task", std::process::id()))
        .map(|it| it.count())
        .unwrap_or(1);
    assert_eq!(count, 1, "daemonize must run before any extra threads start");
}

#[cfg(not(target_os = "linux"))]
fn assert_single_threaded() {}

mod sys {
    use super::*;
    use std::os::unix::io::OwnedFd;
    use std::process::ExitStatus;

    pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
        let mut fds: [RawFd; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error());
        }
        Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
            OwnedFd::from_raw_fd(fds[1])
        }))
    }

    /// # Safety
    /// Must only be called while single-threaded.
    pub unsafe fn fork() -> Result<Option<libc::pid_t>, Error> {
        let pid = libc::fork();
        if pid < 0 {
            Err(Error::last_os_error())
        } else if pid == 0 {
            Ok(None)
        } else {
            Ok(Some(pid))
        }
    }

    pub fn waitpid(pid: libc::pid_t) -> Result<(libc::pid_t, ExitStatus), Error> {
        loop {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, 0) };
            if rc != -1 {
                return Ok((rc, ExitStatus::from_raw(status)));
            }
            let err = Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
