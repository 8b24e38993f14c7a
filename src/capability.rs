//! Terminal capability detection.
//!
//! Decides once per session whether the error stream may receive color,
//! cursor control and in-place progress redraws. Nothing here fails: missing
//! information degrades to the conservative, non-interactive answer.

use std::io::IsTerminal;

/// Environment variable consulted for the progress display mode.
///
/// Matches cargo's `term.progress.when` setting.
pub const PROGRESS_ENV_VAR: &str = "CARGO_TERM_PROGRESS_WHEN";

/// Terminal dimensions in rows and columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Query the size of the controlling terminal.
    ///
    /// Returns `None` when no terminal is attached or it reports a zero size.
    #[must_use]
    pub fn query() -> Option<Self> {
        match crossterm::terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => Some(Self::new(rows, cols)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("terminal size unavailable: {}", e);
                None
            }
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// Progress display mode requested through the environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressMode {
    /// Always render progress, even when the stream is not a terminal.
    Always,
    /// Never redraw in place; only milestone lines are written.
    Never,
    /// Render in place only on an interactive terminal.
    #[default]
    Auto,
}

impl ProgressMode {
    /// Parse an override value. Unknown or missing values mean `Auto`.
    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some("always") => Self::Always,
            Some("never") => Self::Never,
            _ => Self::Auto,
        }
    }

    /// Read the mode from the given environment variable.
    #[must_use]
    pub fn from_env(var: &str) -> Self {
        Self::from_env_value(std::env::var(var).ok().as_deref())
    }

    /// Resolve how a progress operation is displayed on a stream with the
    /// given capabilities.
    #[must_use]
    pub fn display(self, caps: &Capabilities, quiet: bool) -> ProgressDisplay {
        if quiet {
            return ProgressDisplay::Hidden;
        }
        match self {
            Self::Never => ProgressDisplay::Milestones,
            Self::Always if caps.supports_ansi => ProgressDisplay::InPlace,
            Self::Always => ProgressDisplay::Lines,
            Self::Auto if caps.is_interactive && caps.supports_ansi => ProgressDisplay::InPlace,
            Self::Auto => ProgressDisplay::Milestones,
        }
    }
}

/// How a single progress operation is rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressDisplay {
    /// Redraw one live line (or a header row) in place.
    InPlace,
    /// Write each throttled render as a full plain line.
    Lines,
    /// Write occasional plain milestone lines.
    Milestones,
    /// Write nothing until the final message.
    Hidden,
}

/// What the output stream is able to display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// The stream is attached to a terminal device.
    pub is_interactive: bool,
    /// Control sequences (color, cursor, margins) may be written.
    pub supports_ansi: bool,
    /// Terminal width in columns.
    pub width: u16,
    /// Terminal height in rows.
    pub height: u16,
}

impl Capabilities {
    /// Inspect stderr and the environment.
    #[must_use]
    pub fn detect(fallback: TerminalSize) -> Self {
        let is_interactive = std::io::stderr().is_terminal();
        let dumb = std::env::var("TERM").is_ok_and(|term| term == "dumb");
        let size = if is_interactive {
            TerminalSize::query().unwrap_or(fallback)
        } else {
            fallback
        };

        let caps = Self {
            is_interactive,
            supports_ansi: is_interactive && !dumb,
            width: size.cols,
            height: size.rows,
        };
        tracing::debug!(
            "terminal capabilities: interactive={} ansi={} size={}x{}",
            caps.is_interactive,
            caps.supports_ansi,
            caps.width,
            caps.height
        );
        caps
    }

    /// Capabilities of a plain, non-interactive stream.
    #[must_use]
    pub fn plain(size: TerminalSize) -> Self {
        Self {
            is_interactive: false,
            supports_ansi: false,
            width: size.cols,
            height: size.rows,
        }
    }

    /// Capabilities of an ANSI terminal with a fixed size.
    #[must_use]
    pub fn interactive(size: TerminalSize) -> Self {
        Self {
            is_interactive: true,
            supports_ansi: true,
            width: size.cols,
            height: size.rows,
        }
    }

    /// Current size as a [`TerminalSize`].
    #[must_use]
    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.height, self.width)
    }

    /// Drop to plain output after a terminal write failed.
    pub(crate) fn degrade(&mut self) {
        self.is_interactive = false;
        self.supports_ansi = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_value() {
        assert_eq!(ProgressMode::from_env_value(Some("always")), ProgressMode::Always);
        assert_eq!(ProgressMode::from_env_value(Some("never")), ProgressMode::Never);
        assert_eq!(ProgressMode::from_env_value(Some("auto")), ProgressMode::Auto);
        assert_eq!(ProgressMode::from_env_value(Some("")), ProgressMode::Auto);
        assert_eq!(ProgressMode::from_env_value(Some("ALWAYS")), ProgressMode::Auto);
        assert_eq!(ProgressMode::from_env_value(None), ProgressMode::Auto);
    }

    #[test]
    fn test_from_env_reads_variable() {
        let var = "CARGO_PLUGIN_TERM_TEST_PROGRESS_MODE";
        std::env::set_var(var, "never");
        assert_eq!(ProgressMode::from_env(var), ProgressMode::Never);
        std::env::remove_var(var);
        assert_eq!(ProgressMode::from_env(var), ProgressMode::Auto);
    }

    #[test]
    fn test_display_resolution() {
        let tty = Capabilities::interactive(TerminalSize::default());
        let pipe = Capabilities::plain(TerminalSize::default());

        assert_eq!(ProgressMode::Auto.display(&tty, false), ProgressDisplay::InPlace);
        assert_eq!(ProgressMode::Auto.display(&pipe, false), ProgressDisplay::Milestones);
        assert_eq!(ProgressMode::Never.display(&tty, false), ProgressDisplay::Milestones);
        assert_eq!(ProgressMode::Always.display(&tty, false), ProgressDisplay::InPlace);
        assert_eq!(ProgressMode::Always.display(&pipe, false), ProgressDisplay::Lines);
        assert_eq!(ProgressMode::Always.display(&tty, true), ProgressDisplay::Hidden);
    }

    #[test]
    fn test_auto_without_ansi_uses_milestones() {
        let mut caps = Capabilities::interactive(TerminalSize::default());
        caps.supports_ansi = false;
        assert_eq!(ProgressMode::Auto.display(&caps, false), ProgressDisplay::Milestones);
    }

    #[test]
    fn test_degrade() {
        let mut caps = Capabilities::interactive(TerminalSize::new(40, 120));
        caps.degrade();
        assert!(!caps.is_interactive);
        assert!(!caps.supports_ansi);
        assert_eq!(caps.size(), TerminalSize::new(40, 120));
    }

    #[test]
    fn test_detect_never_panics() {
        let caps = Capabilities::detect(TerminalSize::default());
        assert!(caps.width >= 1);
        assert!(caps.height >= 1);
        if !caps.is_interactive {
            assert!(!caps.supports_ansi);
        }
    }
}
