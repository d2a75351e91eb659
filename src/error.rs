//! Error classification for the dispatcher loop.
//!
//! The core sticks with `anyhow::Error` for everything that crosses a module boundary, the same
//! way the crate this one is grounded on does for daemonization and pidfile handling. The only
//! addition is [`Severity`], a small tag the dispatcher consults to decide whether an error means
//! "stop looping and exit nonzero", "drain workers and exit 0", or "log and keep going".

use std::fmt;

/// How the dispatcher should react to a given failure (§7 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Fails before the loop begins: lock file, daemonize, UID switch, IPC attach.
    StartupFatal,
    /// Mutex or slot-storage failure mid-loop: stop looping, proceed straight to teardown.
    LoopFatal,
    /// `fork()` failed or `get_next_job` raised: finish draining workers, then exit 0.
    GracefulTerminate,
    /// `child_run` raised in a worker: caught locally, doesn't reach the supervisor at all.
    PerJob,
    /// Not actually an error condition (e.g. "no children to reap").
    Benign,
    /// Worth one retry before being given up on (e.g. a `kill()` relay).
    Transient,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::StartupFatal => "startup-fatal",
            Severity::LoopFatal => "loop-fatal",
            Severity::GracefulTerminate => "graceful-terminate",
            Severity::PerJob => "per-job",
            Severity::Benign => "benign",
            Severity::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// Extension trait attaching a [`Severity`] to an `anyhow::Error` without introducing a parallel
/// error hierarchy, mirroring the teacher's preference for `anyhow::Context` over bespoke error
/// enums.
pub trait ResultExt<T> {
    fn with_severity(self, severity: Severity) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn with_severity(self, severity: Severity) -> anyhow::Result<T> {
        self.map_err(|e| e.into().context(severity))
    }
}

/// Recovers a [`Severity`] previously attached via [`ResultExt::with_severity`], if any.
pub fn severity_of(err: &anyhow::Error) -> Option<Severity> {
    err.chain().find_map(|cause| {
        // `anyhow::Context` stores the context value behind `Display`; since `Severity` is a
        // small closed enum we can recover it by matching the rendered string.
        let rendered = cause.to_string();
        match rendered.as_str() {
            "startup-fatal" => Some(Severity::StartupFatal),
            "loop-fatal" => Some(Severity::LoopFatal),
            "graceful-terminate" => Some(Severity::GracefulTerminate),
            "per-job" => Some(Severity::PerJob),
            "benign" => Some(Severity::Benign),
            "transient" => Some(Severity::Transient),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn severity_round_trips_through_context() {
        let err: anyhow::Result<()> =
            Err(anyhow!("waitpid failed")).with_severity(Severity::LoopFatal);
        let err = err.unwrap_err();
        assert_eq!(severity_of(&err), Some(Severity::LoopFatal));
    }

    #[test]
    fn untagged_error_has_no_severity() {
        let err = anyhow!("plain error");
        assert_eq!(severity_of(&err), None);
    }
}
