//! # cargo-plugin-term
//!
//! Terminal output for cargo plugins that looks and behaves like cargo's own.
//!
//! One [`TerminalSession`] owns the error stream. Through it a tool writes
//! aligned, colored status lines, drives throttled progress bars, and runs
//! child processes in a PTY so their colored output streams live inside a
//! scrolling band beneath a pinned status header.
//!
//! ## Features
//!
//! - **Status lines**: right-aligned verb labels colored by level
//! - **Progress**: bar with percentage and ETA, spinner for unknown totals,
//!   plain milestone lines when the stream is not a terminal
//! - **Scroll regions**: a pinned header above a bounded scrolling body,
//!   always restored on every exit path
//! - **PTY subprocesses**: children keep their colors; interrupts are
//!   forwarded and the raw exit status is returned
//! - **Graceful degradation**: no control sequences on pipes, dumb
//!   terminals, or after a failed terminal write
//!
//! The progress display honors `CARGO_TERM_PROGRESS_WHEN` (`always`,
//! `never`, anything else means `auto`).
//!
//! ## Example
//!
//! ```no_run
//! use cargo_plugin_term::{SpawnConfig, StatusMessage, TerminalSession};
//!
//! #[tokio::main]
//! async fn main() -> cargo_plugin_term::Result<()> {
//!     let session = TerminalSession::detect();
//!     session.info("Checking", "my-crate v0.1.0");
//!
//!     let result = session
//!         .run(
//!             SpawnConfig::new("cargo")
//!                 .arg("build")
//!                 .status(StatusMessage::info("Building", "my-crate")),
//!         )
//!         .await?;
//!
//!     if result.success() {
//!         session.success("Finished", "build");
//!     } else {
//!         session.error("Failed", &format!("cargo exited with {}", result.exit_code));
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod ansi;
mod capability;
mod error;
mod progress;
mod pty;
mod region;
mod session;
mod signals;
mod status;
mod subprocess;

#[cfg(test)]
mod test_support;

// Re-export public API
pub use ansi::{ResetScrollMargins, SetScrollMargins};
pub use capability::{Capabilities, ProgressDisplay, ProgressMode, TerminalSize, PROGRESS_ENV_VAR};
pub use error::{Error, Result};
pub use progress::{ProgressHandle, ProgressState};
pub use region::ScrollRegion;
pub use session::{SessionConfig, TerminalSession};
pub use status::{Level, StatusMessage};
pub use subprocess::{RunState, SpawnConfig, SubprocessResult};
