//! Error types for the cargo-plugin-term crate.

use thiserror::Error;

/// Result type alias using this crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the terminal or a PTY child.
///
/// A child exiting with a non-zero status is not an error; it is reported
/// through [`SubprocessResult`](crate::SubprocessResult).
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to create the PTY pair.
    #[error("failed to create PTY: {0}")]
    PtyCreate(String),

    /// The child process could not be spawned.
    #[error("failed to spawn `{program}`: {reason}")]
    Spawn {
        /// Program that was requested.
        program: String,
        /// Description from the OS or PTY layer.
        reason: String,
    },

    /// Failed to resize the PTY after a terminal resize.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Anyhow error from portable-pty.
    #[error("PTY error: {0}")]
    Pty(#[from] anyhow::Error),

    /// I/O failure around the runner (signal registration, waiting).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A scroll region is already reserved on this session.
    #[error("a scroll region is already reserved on this terminal session")]
    RegionActive,

    /// A subprocess is already streaming into the active scroll region.
    #[error("a subprocess is already streaming into the active scroll region")]
    SubprocessActive,
}
