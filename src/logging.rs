//! Structured logging (§6, §6a): the core requires only a level-filtered append interface and a
//! "reopen file" operation for log-rotation integration, and binds both to `tracing` /
//! `tracing-subscriber` / `tracing-appender` the same way the teacher crate's own daemonization
//! log lines (`event!(Level::ERROR, ...)`, `event!(Level::INFO, ...)`) already do. No bespoke
//! logger is invented here; this module only supplies the §6a level mapping and the reopen hook
//! the spec calls out as the logger's one core-facing contract beyond plain level filtering.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Target used for the distinguished `DAEMON` level (§4.4 note in §6a table): supervisor-internal
/// trace, filterable independently of application-level log noise via `RUST_LOG=daemon::internal=trace`.
pub const DAEMON_TARGET: &str = "daemon::internal";

/// The spec's ten logging levels (§6), mapped onto `tracing::Level` + target per the §6a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
    Debug2,
    Daemon,
}

/// Emits `msg` at the `tracing` level/target the §6a table assigns to `level`. A thin dispatch
/// function rather than a macro, since `tracing::event!` needs its level as a compile-time
/// literal and the core wants to pick the level dynamically from a [`LogLevel`] value.
pub fn log(level: LogLevel, msg: &str) {
    match level {
        LogLevel::Daemon => tracing::event!(target: DAEMON_TARGET, Level::TRACE, "{msg}"),
        LogLevel::Debug2 => tracing::event!(Level::TRACE, "{msg}"),
        LogLevel::Debug => tracing::event!(Level::DEBUG, "{msg}"),
        LogLevel::Notice | LogLevel::Info => tracing::event!(Level::INFO, "{msg}"),
        LogLevel::Warn => tracing::event!(Level::WARN, "{msg}"),
        LogLevel::Error | LogLevel::Crit | LogLevel::Alert | LogLevel::Emerg => {
            tracing::event!(Level::ERROR, "{msg}")
        }
    }
}

/// A `tracing_subscriber` writer over a plain file that can be reopened in place, for
/// log-rotation tools (e.g. `logrotate` with `copytruncate` disabled) that expect the daemon to
/// reopen its log file on request rather than keep writing to an unlinked inode.
#[derive(Clone)]
pub struct ReopenableWriter {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open(&path)?;
        Ok(ReopenableWriter {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Closes and reopens the underlying file at the same path, picking up a fresh inode if
    /// something else (logrotate) has since renamed the old one out of the way.
    pub fn reopen(&self) -> Result<()> {
        let new_file = open(&self.path)?;
        *self.file.lock().unwrap() = new_file;
        Ok(())
    }
}

fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("{}: open failed", path.display()))
}

pub struct FileWriterHandle<'a>(MutexGuard<'a, File>);

impl io::Write for FileWriterHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'w> MakeWriter<'w> for ReopenableWriter {
    type Writer = FileWriterHandle<'w>;

    fn make_writer(&'w self) -> Self::Writer {
        FileWriterHandle(self.file.lock().unwrap())
    }
}

/// A running log destination, returned by [`init_file`] so the embedder can [`LogHandle::reopen`]
/// it later (e.g. from its own SIGHUP handling, distinct from this crate's config-reload HUP).
pub struct LogHandle {
    writer: Option<ReopenableWriter>,
}

impl LogHandle {
    pub fn reopen(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.reopen(),
            None => Ok(()),
        }
    }
}

/// Installs a global `tracing` subscriber writing to stderr, filtered by `RUST_LOG` (defaulting
/// to `info`). Intended for the pre-detach, foreground portion of startup (§7: "startup failures
/// surface on stderr/stdout before detachment").
pub fn init_stderr() -> LogHandle {
    let filter = env_filter();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
    LogHandle { writer: None }
}

/// Installs a global `tracing` subscriber writing to `path`, filtered by `RUST_LOG`. Intended for
/// post-detach logging (§7: "post-detachment errors appear only in the configured log").
pub fn init_file(path: impl Into<PathBuf>) -> Result<LogHandle> {
    let writer = ReopenableWriter::create(path)?;
    let filter = env_filter();
    tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_env_filter(filter)
        .init();
    Ok(LogHandle {
        writer: Some(writer),
    })
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
