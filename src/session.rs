//! Terminal session - the single owner of everything written to the terminal.
//!
//! Status lines, progress redraws, scroll-region control and subprocess
//! output all funnel through one [`TerminalSession`]. Its internal mutex is
//! the only path to the output stream, so concurrent writers never tear each
//! other's lines.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use tokio::sync::watch;

use crate::capability::{Capabilities, ProgressDisplay, ProgressMode, TerminalSize, PROGRESS_ENV_VAR};
use crate::region::RegionState;
use crate::status::{Line, StatusMessage};
use crate::subprocess::RunState;

/// Configuration for a terminal session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Environment variable holding the progress display override.
    pub progress_env_var: String,
    /// Explicit progress mode; when set the environment is not consulted.
    pub progress_mode: Option<ProgressMode>,
    /// Column width labels are right-aligned to.
    pub label_width: usize,
    /// Header rows reserved above subprocess output.
    pub header_rows: u16,
    /// Minimum time between two in-place progress redraws.
    pub throttle: Duration,
    /// Width of the progress bar in characters.
    pub bar_width: usize,
    /// Percentage step between milestone lines for known totals.
    pub milestone_percent: u8,
    /// Time between milestone lines (and plain progress lines).
    pub milestone_interval: Duration,
    /// How long to keep draining PTY output after the child exits.
    pub drain_timeout: Duration,
    /// Size assumed when the terminal cannot be queried.
    pub default_size: TerminalSize,
    /// Suppress info/success lines and progress; warnings and errors remain.
    pub quiet: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            progress_env_var: PROGRESS_ENV_VAR.to_string(),
            progress_mode: None,
            label_width: 12,
            header_rows: 1,
            throttle: Duration::from_millis(100),
            bar_width: 25,
            milestone_percent: 10,
            milestone_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            default_size: TerminalSize::default(),
            quiet: false,
        }
    }
}

impl SessionConfig {
    /// Read the progress override from a different environment variable.
    #[must_use]
    pub fn progress_env_var(mut self, var: impl Into<String>) -> Self {
        self.progress_env_var = var.into();
        self
    }

    /// Force a progress mode instead of reading the environment.
    #[must_use]
    pub fn progress_mode(mut self, mode: ProgressMode) -> Self {
        self.progress_mode = Some(mode);
        self
    }

    /// Set the label column width.
    #[must_use]
    pub fn label_width(mut self, width: usize) -> Self {
        self.label_width = width;
        self
    }

    /// Set the number of header rows reserved by subprocess runs.
    #[must_use]
    pub fn header_rows(mut self, rows: u16) -> Self {
        self.header_rows = rows.max(1);
        self
    }

    /// Set the progress redraw throttle.
    #[must_use]
    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = interval;
        self
    }

    /// Set the progress bar width.
    #[must_use]
    pub fn bar_width(mut self, width: usize) -> Self {
        self.bar_width = width;
        self
    }

    /// Set the percentage step between milestone lines.
    #[must_use]
    pub fn milestone_percent(mut self, percent: u8) -> Self {
        self.milestone_percent = percent.clamp(1, 100);
        self
    }

    /// Set the interval between milestone lines.
    #[must_use]
    pub fn milestone_interval(mut self, interval: Duration) -> Self {
        self.milestone_interval = interval;
        self
    }

    /// Set the post-exit drain timeout.
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the fallback terminal size.
    #[must_use]
    pub fn default_size(mut self, size: TerminalSize) -> Self {
        self.default_size = size;
        self
    }

    /// Enable or disable quiet mode.
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn resolve_mode(&self) -> ProgressMode {
        self.progress_mode
            .unwrap_or_else(|| ProgressMode::from_env(&self.progress_env_var))
    }
}

/// Where the terminal size comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SizeSource {
    /// Query the controlling terminal.
    Terminal,
    /// Only change through [`TerminalSession::set_size`].
    Fixed,
}

/// Mutable terminal state guarded by the session lock.
pub(crate) struct TerminalState {
    pub(crate) sink: Box<dyn Write + Send>,
    pub(crate) caps: Capabilities,
    pub(crate) mode: ProgressMode,
    pub(crate) label_width: usize,
    pub(crate) region: Option<RegionState>,
    /// Live progress line and the id of the handle that owns it.
    pub(crate) live: Option<(u64, Line)>,
    /// The last body byte written was not a newline.
    pub(crate) body_mid_line: bool,
    degraded: bool,
}

impl TerminalState {
    /// Run a batch of writes and flush. A failure drops the session to
    /// plain output instead of reaching the caller.
    pub(crate) fn commit<F>(&mut self, op: F)
    where
        F: FnOnce(&mut Self) -> io::Result<()>,
    {
        let result = op(self).and_then(|()| self.sink.flush());
        if let Err(e) = result {
            self.degrade(&e);
        }
    }

    fn degrade(&mut self, error: &io::Error) {
        if self.caps.supports_ansi {
            tracing::warn!(
                "terminal write failed, continuing without control sequences: {}",
                error
            );
            self.caps.degrade();
            self.degraded = true;
            self.live = None;
            if let Some(region) = &mut self.region {
                region.active = false;
            }
        } else {
            tracing::debug!("terminal write failed: {}", error);
        }
    }

    pub(crate) fn region_active(&self) -> bool {
        self.region.as_ref().is_some_and(|r| r.active)
    }

    /// Column budget for lines that must not wrap.
    pub(crate) fn line_budget(&self) -> usize {
        usize::from(self.caps.width.saturating_sub(1)).max(1)
    }

    /// Carriage return and clear the cursor row.
    pub(crate) fn erase_line(&mut self) -> io::Result<()> {
        queue!(self.sink, MoveToColumn(0), Clear(ClearType::CurrentLine))
    }

    /// Write a permanent line: into the header when a region is drawn,
    /// otherwise above the live progress line.
    pub(crate) fn write_line(&mut self, line: Line) -> io::Result<()> {
        if self.region_active() {
            self.push_header(line);
            return self.draw_header();
        }

        let ansi = self.caps.supports_ansi;
        let live = ansi && self.live.is_some();
        if live {
            self.erase_line()?;
        } else if self.body_mid_line {
            self.sink.write_all(b"\n")?;
        }

        let text = line.render(self.label_width, ansi, None);
        self.sink.write_all(text.as_bytes())?;
        self.sink.write_all(b"\n")?;
        self.body_mid_line = false;

        if live {
            self.draw_live_in_place()?;
        }
        Ok(())
    }

    /// Write subprocess output. Inside a drawn region the bytes go out
    /// untouched at the body cursor.
    pub(crate) fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let live = !self.region_active() && self.caps.supports_ansi && self.live.is_some();
        if live {
            self.erase_line()?;
        }
        self.sink.write_all(data)?;
        self.body_mid_line = data.last() != Some(&b'\n');
        if live {
            self.draw_live_in_place()?;
        }
        Ok(())
    }

    /// Draw the live progress line wherever it currently belongs.
    pub(crate) fn draw_live(&mut self) -> io::Result<()> {
        if !self.caps.supports_ansi {
            return Ok(());
        }
        if self.region_active() {
            self.draw_header()
        } else {
            self.draw_live_in_place()
        }
    }

    pub(crate) fn draw_live_in_place(&mut self) -> io::Result<()> {
        let budget = Some(self.line_budget());
        let text = match &self.live {
            Some((_, line)) => line.render(self.label_width, true, budget),
            None => return Ok(()),
        };
        if self.body_mid_line {
            self.sink.write_all(b"\r\n")?;
            self.body_mid_line = false;
        }
        self.erase_line()?;
        self.sink.write_all(text.as_bytes())
    }

    /// Show `line` as the live progress line owned by `owner`. Plain streams
    /// have no live line.
    pub(crate) fn show_live(&mut self, owner: u64, line: Line) {
        if !self.caps.supports_ansi {
            return;
        }
        self.live = Some((owner, line));
        self.commit(Self::draw_live);
    }

    /// Remove the live line from the screen. The caller clears `live` first.
    fn erase_live(&mut self) -> io::Result<()> {
        if !self.caps.supports_ansi {
            return Ok(());
        }
        if self.region_active() {
            self.draw_header()
        } else {
            self.erase_line()
        }
    }
}

/// The single writer to the terminal.
///
/// Create one per process with [`TerminalSession::detect`] and pass it by
/// reference (or share it behind an `Arc`) to every operation. It is not
/// `Clone`: there is exactly one owner of the terminal.
pub struct TerminalSession {
    config: SessionConfig,
    size_source: SizeSource,
    state: Arc<Mutex<TerminalState>>,
    next_id: AtomicU64,
    run_state: watch::Sender<RunState>,
}

impl TerminalSession {
    /// Detect capabilities of stderr with the default configuration.
    #[must_use]
    pub fn detect() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// Detect capabilities of stderr with a custom configuration.
    #[must_use]
    pub fn with_config(config: SessionConfig) -> Self {
        let caps = Capabilities::detect(config.default_size);
        Self::build(Box::new(io::stderr()), caps, config, SizeSource::Terminal)
    }

    /// Write to an arbitrary sink with explicit capabilities.
    ///
    /// The size only changes through [`TerminalSession::set_size`].
    #[must_use]
    pub fn with_writer(
        writer: impl Write + Send + 'static,
        caps: Capabilities,
        config: SessionConfig,
    ) -> Self {
        Self::build(Box::new(writer), caps, config, SizeSource::Fixed)
    }

    fn build(
        sink: Box<dyn Write + Send>,
        caps: Capabilities,
        config: SessionConfig,
        size_source: SizeSource,
    ) -> Self {
        let mode = config.resolve_mode();
        tracing::debug!("progress mode: {:?}", mode);
        let state = TerminalState {
            sink,
            caps,
            mode,
            label_width: config.label_width,
            region: None,
            live: None,
            body_mid_line: false,
            degraded: false,
        };
        let (run_state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            size_source,
            state: Arc::new(Mutex::new(state)),
            next_id: AtomicU64::new(1),
            run_state,
        }
    }

    /// Lock the terminal state. A poisoned lock is recovered so the terminal
    /// can still be restored after a panic elsewhere.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The locked state, for writers that outlive a borrow of the session.
    pub(crate) fn shared_state(&self) -> Arc<Mutex<TerminalState>> {
        Arc::clone(&self.state)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current capabilities.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.lock().caps
    }

    /// Progress mode resolved at creation or the last [`refresh`](Self::refresh).
    #[must_use]
    pub fn progress_mode(&self) -> ProgressMode {
        self.lock().mode
    }

    /// How a progress operation started now would be displayed.
    #[must_use]
    pub fn progress_display(&self) -> ProgressDisplay {
        let state = self.lock();
        state.mode.display(&state.caps, self.config.quiet)
    }

    /// Whether a scroll region is reserved.
    #[must_use]
    pub fn region_active(&self) -> bool {
        self.lock().region.is_some()
    }

    /// Watch the state of the current (or last) subprocess run.
    #[must_use]
    pub fn run_state(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        tracing::debug!("subprocess run state: {:?}", state);
        self.run_state.send_replace(state);
    }

    /// Re-read the progress override and, for real terminals, capabilities.
    ///
    /// A session that fell back to plain output after a write failure stays
    /// plain.
    pub fn refresh(&self) {
        let mode = self.config.resolve_mode();
        let detected = (self.size_source == SizeSource::Terminal)
            .then(|| Capabilities::detect(self.config.default_size));

        let mut state = self.lock();
        state.mode = mode;
        if let Some(caps) = detected {
            if !state.degraded {
                state.caps.is_interactive = caps.is_interactive;
                state.caps.supports_ansi = caps.supports_ansi;
            }
            drop(state);
            self.set_size(caps.size());
        }
    }

    /// Apply a new terminal size. Re-reserves an active scroll region.
    ///
    /// Returns `true` when the size changed.
    pub fn set_size(&self, size: TerminalSize) -> bool {
        let mut state = self.lock();
        if state.caps.size() == size {
            return false;
        }
        tracing::debug!("terminal resized to {}x{}", size.cols, size.rows);
        state.caps.width = size.cols;
        state.caps.height = size.rows;
        if state.region.is_some() {
            state.commit(TerminalState::resize_region);
        }
        true
    }

    /// Re-query the terminal size and apply it.
    ///
    /// Returns `true` when the size changed.
    pub fn sync_size(&self) -> bool {
        if self.size_source == SizeSource::Fixed {
            return false;
        }
        TerminalSize::query().is_some_and(|size| self.set_size(size))
    }

    /// Write one status line.
    pub fn emit(&self, message: &StatusMessage) {
        if self.config.quiet && !message.level().survives_quiet() {
            return;
        }
        let mut state = self.lock();
        state.commit(|s| s.write_line(Line::Status(message.clone())));
    }

    /// Write an info line.
    pub fn info(&self, label: &str, text: &str) {
        self.emit(&StatusMessage::info(label, text));
    }

    /// Write a warning line.
    pub fn warning(&self, label: &str, text: &str) {
        self.emit(&StatusMessage::warning(label, text));
    }

    /// Write an error line.
    pub fn error(&self, label: &str, text: &str) {
        self.emit(&StatusMessage::error(label, text));
    }

    /// Write a success line.
    pub fn success(&self, label: &str, text: &str) {
        self.emit(&StatusMessage::success(label, text));
    }

    /// Write a permanent unlabeled line.
    pub fn print_line(&self, text: &str) {
        if self.config.quiet {
            return;
        }
        let mut state = self.lock();
        state.commit(|s| s.write_line(Line::Plain(text.to_string())));
    }

    /// Run `f` with the live progress line taken off the screen, then put it
    /// back. Use this around code that writes to stderr directly.
    ///
    /// The session lock is held while `f` runs, so `f` must not call back
    /// into this session.
    pub fn suspend<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let mut state = self.lock();
        let hide = state.caps.supports_ansi && !state.region_active() && state.live.is_some();
        if hide {
            state.commit(TerminalState::erase_line);
        }
        let result = f();
        if hide {
            state.commit(TerminalState::draw_live_in_place);
        }
        result
    }

    /// Remove the live line if `owner` still owns it.
    pub(crate) fn clear_live(&self, owner: u64) {
        let mut state = self.lock();
        if state.live.as_ref().is_some_and(|(id, _)| *id == owner) {
            state.live = None;
            state.commit(TerminalState::erase_live);
        }
    }

    pub(crate) fn write_body(&self, data: &[u8]) {
        let mut state = self.lock();
        state.commit(|s| s.write_body(data));
    }
}

impl Default for TerminalSession {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TerminalSession")
            .field("caps", &state.caps)
            .field("mode", &state.mode)
            .field("region_active", &state.region.is_some())
            .finish_non_exhaustive()
    }
}
