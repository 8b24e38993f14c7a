//! Subprocess types: what to spawn, how a run progresses and what it
//! returns.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use portable_pty::CommandBuilder;

use crate::status::StatusMessage;

/// Configuration for running a child process in a PTY.
#[derive(Clone, Debug)]
pub struct SpawnConfig {
    /// Program to run, resolved through `PATH`.
    pub command: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory. Defaults to the current directory.
    pub cwd: Option<PathBuf>,

    /// Additional environment variables.
    pub env: HashMap<String, String>,

    /// Header rows above the output. Defaults to the session's setting.
    pub header_rows: Option<u16>,

    /// Status line shown in the header while the child runs.
    pub status: Option<StatusMessage>,
}

impl SpawnConfig {
    /// Run `command` with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            header_rows: None,
            status: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Reserve a different number of header rows.
    #[must_use]
    pub fn header_rows(mut self, rows: u16) -> Self {
        self.header_rows = Some(rows.max(1));
        self
    }

    /// Show `message` in the header while the child runs.
    #[must_use]
    pub fn status(mut self, message: StatusMessage) -> Self {
        self.status = Some(message);
        self
    }

    /// Build the portable-pty command.
    pub(crate) fn command_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.command);
        cmd.args(&self.args);

        // portable-pty starts children in $HOME unless told otherwise
        match self.cwd.clone().or_else(|| std::env::current_dir().ok()) {
            Some(cwd) => cmd.cwd(cwd),
            None => tracing::debug!("no working directory for `{}`", self.command),
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Lifecycle of one subprocess run.
///
/// ```text
/// Idle -> PtyAllocated -> ChildSpawned -> Streaming -> Exited -> RegionReleased
///      \______________________________________________________/
///                         any failure -> Failed
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    /// No run has started.
    #[default]
    Idle,
    /// The PTY pair exists.
    PtyAllocated,
    /// The child is running.
    ChildSpawned,
    /// Child output is flowing into the body.
    Streaming,
    /// The child exited; remaining output is draining.
    Exited {
        /// Raw exit status.
        code: u32,
    },
    /// The run is over and any region it reserved is released.
    RegionReleased,
    /// The run failed before a result could be produced.
    Failed,
}

impl RunState {
    /// Whether the run is over.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::RegionReleased | Self::Failed)
    }
}

/// Outcome of a subprocess run.
#[derive(Clone, Debug)]
pub struct SubprocessResult {
    /// Raw exit status of the child, never translated.
    pub exit_code: u32,

    /// Wall time from spawn to the end of output.
    pub duration: Duration,

    /// Everything the child wrote to its terminal, escape sequences included.
    pub output: Vec<u8>,

    /// An interrupt or termination signal was forwarded during the run.
    pub interrupted: bool,

    /// Name of the signal that killed the child, e.g. "Interrupt". `None`
    /// when it exited normally; `exit_code` is then the child's own status.
    pub signal: Option<String>,
}

impl SubprocessResult {
    /// Whether the child exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Whether the child was killed by a signal rather than exiting.
    #[must_use]
    pub fn was_killed(&self) -> bool {
        self.signal.is_some()
    }

    /// The captured output as UTF-8.
    ///
    /// # Errors
    /// Returns an error if the output is not valid UTF-8.
    pub fn output_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.output)
    }

    /// The captured output with invalid UTF-8 replaced.
    #[must_use]
    pub fn output_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_config_builder() {
        let config = SpawnConfig::new("cargo")
            .arg("build")
            .args(["--release", "--quiet"])
            .env("CARGO_TERM_COLOR", "always")
            .header_rows(0);

        assert_eq!(config.command, "cargo");
        assert_eq!(config.args, vec!["build", "--release", "--quiet"]);
        assert_eq!(config.env.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
        assert_eq!(config.header_rows, Some(1));
    }

    #[test]
    fn test_run_state_finished() {
        assert!(!RunState::Idle.is_finished());
        assert!(!RunState::Exited { code: 0 }.is_finished());
        assert!(RunState::RegionReleased.is_finished());
        assert!(RunState::Failed.is_finished());
    }

    #[test]
    fn test_result_helpers() {
        let result = SubprocessResult {
            exit_code: 2,
            duration: Duration::from_millis(5),
            output: b"warning\xff".to_vec(),
            interrupted: false,
            signal: None,
        };
        assert!(!result.success());
        assert!(!result.was_killed());
        assert!(result.output_str().is_err());
        assert_eq!(result.output_lossy(), "warning\u{fffd}");
    }

    #[test]
    fn test_killed_child_is_not_success() {
        let result = SubprocessResult {
            exit_code: 0,
            duration: Duration::ZERO,
            output: Vec::new(),
            interrupted: true,
            signal: Some("Interrupt".to_string()),
        };
        assert!(result.was_killed());
        assert!(!result.success());
    }
}
