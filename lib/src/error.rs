//! The error taxonomy shared across the discovery engine.
//!
//! Parsers and the discovery driver never treat an error as fatal on their
//! own; only the handful of startup failures named in [`Error::Fatal`]
//! should cause the daemon binary to exit non-zero. Everything else is
//! logged and degrades the affected device or parser to a no-op.

use thiserror::Error;

/// A single error kind from the discovery engine's taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// open/read/write/fstat/mount failed; recoverable by skipping the
    /// offending file or device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A parser rejected its input; the parse chain moves on to the next
    /// parser.
    #[error("config format error: {0}")]
    Format(String),

    /// A referenced resource could not be resolved against the device
    /// registry; the option referencing it is retained but unpublished.
    #[error("unresolved resource: {0}")]
    MissingResource(String),

    /// A child process invoked via the subprocess supervisor exited
    /// non-zero.
    #[error("subprocess {argv0} failed: {status}")]
    SubprocessFailure { argv0: String, status: String },

    /// A malformed IPC frame; the offending client connection is closed.
    #[error("IPC protocol error: {0}")]
    Protocol(String),

    /// A signature verification collaborator rejected a boot image. Fatal
    /// for the affected boot attempt, but does not stop discovery.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Infrastructure failure during startup: acquiring the listening
    /// socket, initialising udev, or installing the SIGCHLD handler. The
    /// process should exit non-zero.
    #[error("fatal startup error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the handful of conditions that should cause the daemon to exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
