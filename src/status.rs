//! Leveled status messages in cargo's style.
//!
//! ```text
//!    Compiling foo v0.1.0
//!      Warning unused manifest key
//! ```

use crossterm::style::{Color, Stylize};

/// Severity of a status message; selects the label color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    /// Neutral progress information.
    Info,
    /// Something worth attention that does not stop the tool.
    Warning,
    /// A failure.
    Error,
    /// A completed step.
    Success,
}

impl Level {
    /// Label color for this level.
    #[must_use]
    pub fn color(self) -> Color {
        match self {
            Self::Info => Color::Cyan,
            Self::Warning => Color::Yellow,
            Self::Error => Color::Red,
            Self::Success => Color::Green,
        }
    }

    /// Whether quiet mode still prints this level.
    pub(crate) fn survives_quiet(self) -> bool {
        matches!(self, Self::Warning | Self::Error)
    }
}

/// A single status line: a short verb label and free-form text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    level: Level,
    label: String,
    text: String,
}

impl StatusMessage {
    /// Create a new status message.
    #[must_use]
    pub fn new(level: Level, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            label: label.into(),
            text: text.into(),
        }
    }

    /// An [`Level::Info`] message.
    #[must_use]
    pub fn info(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Level::Info, label, text)
    }

    /// A [`Level::Warning`] message.
    #[must_use]
    pub fn warning(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Level::Warning, label, text)
    }

    /// An [`Level::Error`] message.
    #[must_use]
    pub fn error(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Level::Error, label, text)
    }

    /// A [`Level::Success`] message.
    #[must_use]
    pub fn success(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Level::Success, label, text)
    }

    /// Message level.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Short verb label, e.g. "Building".
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Message body.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Render the line without a trailing newline.
    pub(crate) fn format(&self, label_width: usize, ansi: bool) -> String {
        let label = format_label(&self.label, label_width, self.level, ansi);
        if self.text.is_empty() {
            label
        } else {
            format!("{label} {}", self.text)
        }
    }
}

/// One line of session output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Line {
    Status(StatusMessage),
    Plain(String),
}

impl Line {
    /// Render without a trailing newline. With `max_cols` the visible text is
    /// cut so the line never wraps; the label itself is never cut.
    pub(crate) fn render(&self, label_width: usize, ansi: bool, max_cols: Option<usize>) -> String {
        match (self, max_cols) {
            (Self::Status(message), None) => message.format(label_width, ansi),
            (Self::Status(message), Some(max)) => {
                let label_cols = message.label.chars().count().max(label_width);
                let room = max.saturating_sub(label_cols + 1);
                let text: String = message.text.chars().take(room).collect();
                let label = format_label(&message.label, label_width, message.level, ansi);
                if text.is_empty() {
                    label
                } else {
                    format!("{label} {text}")
                }
            }
            (Self::Plain(text), None) => text.clone(),
            (Self::Plain(text), Some(max)) => text.chars().take(max).collect(),
        }
    }
}

/// Right-align `label` to `width` columns, colored when `ansi` is set.
///
/// Labels wider than `width` are kept whole.
pub(crate) fn format_label(label: &str, width: usize, level: Level, ansi: bool) -> String {
    let padded = format!("{label:>width$}");
    if ansi {
        padded.with(level.color()).bold().to_string()
    } else {
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_format_aligns_text() {
        let a = StatusMessage::info("Building", "foo").format(12, false);
        let b = StatusMessage::info("Fresh", "bar").format(12, false);
        assert_eq!(a, "    Building foo");
        assert_eq!(b, "       Fresh bar");
        assert_eq!(a.find("foo"), b.find("bar"));
    }

    #[test]
    fn test_same_level_lines_differ_only_in_text() {
        let a = StatusMessage::warning("Skipping", "one").format(12, false);
        let b = StatusMessage::warning("Skipping", "two").format(12, false);
        assert_eq!(a[..13], b[..13]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_long_label_not_truncated() {
        let line = StatusMessage::info("Synchronizing", "x").format(12, false);
        assert_eq!(line, "Synchronizing x");
    }

    #[test]
    fn test_ansi_format_styles_label_only() {
        let line = StatusMessage::error("Error", "broken").format(12, true);
        assert!(line.contains("\x1b["));
        assert!(line.contains("       Error"));
        assert!(line.ends_with(" broken"));
    }

    #[test]
    fn test_plain_format_has_no_escape() {
        for level in [Level::Info, Level::Warning, Level::Error, Level::Success] {
            let line = StatusMessage::new(level, "Checking", "x").format(12, false);
            assert!(!line.contains('\x1b'));
        }
    }

    #[test]
    fn test_fitted_line_cuts_text_only() {
        let line = Line::Status(StatusMessage::info("Building", "a very long crate name"));
        assert_eq!(line.render(12, false, Some(20)), "    Building a very ");
        assert_eq!(line.render(12, false, Some(10)), "    Building");

        let plain = Line::Plain("abcdef".to_string());
        assert_eq!(plain.render(12, true, Some(3)), "abc");
        assert_eq!(plain.render(12, true, None), "abcdef");
    }

    #[test]
    fn test_quiet_levels() {
        assert!(!Level::Info.survives_quiet());
        assert!(!Level::Success.survives_quiet());
        assert!(Level::Warning.survives_quiet());
        assert!(Level::Error.survives_quiet());
    }
}
