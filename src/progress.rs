//! Throttled progress reporting.
//!
//! Counting, timing and the in-place bar come from indicatif. Its frames are
//! drawn through [`SessionTerm`], a [`TermLike`] that writes via the session
//! lock, so the bar shares the terminal with status lines and subprocess
//! output instead of owning it. Plain streams get milestone lines instead.
//! Every handle ends with exactly one permanent line from
//! [`ProgressHandle::finish`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use indicatif::{
    FormattedDuration, HumanDuration, ProgressBar, ProgressDrawTarget, ProgressStyle, TermLike,
};

use crate::capability::ProgressDisplay;
use crate::error::Result;
use crate::region::ScrollRegion;
use crate::session::{TerminalSession, TerminalState};
use crate::status::{Line, StatusMessage};

/// Spinner frames; indicatif shows the last one only once finished.
const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// How often an indeterminate spinner advances on its own.
const SPINNER_TICK: Duration = Duration::from_millis(100);

/// Header rows reserved by a pinned progress operation: a status row and the
/// progress row beneath it.
const PINNED_HEADER_ROWS: u16 = 2;

/// Counters of one progress operation.
#[derive(Clone, Debug)]
pub struct ProgressState {
    label: String,
    total: Option<u64>,
    current: u64,
    message: String,
}

impl ProgressState {
    /// Start a new operation at zero.
    #[must_use]
    pub fn new(label: impl Into<String>, total: Option<u64>) -> Self {
        Self {
            label: label.into(),
            total,
            current: 0,
            message: String::new(),
        }
    }

    /// Label shown before the bar.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Known total, `None` for indeterminate progress.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Items completed so far.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Message shown after the counters.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whole percent done, rounded down. A zero total counts as done.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        Some(floor_percent(self.current, self.total?))
    }

    /// Whether a known total has been reached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.current >= total)
    }

    /// Move to `current`. Values below the current count are ignored and
    /// values above the total are clamped.
    fn advance_to(&mut self, current: u64) -> bool {
        if current < self.current {
            return false;
        }
        self.current = self.total.map_or(current, |total| current.min(total));
        true
    }
}

fn floor_percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = u128::from(current) * 100 / u128::from(total);
    u8::try_from(percent).unwrap_or(100)
}

fn estimate_remaining(elapsed: Duration, current: u64, total: u64) -> Option<Duration> {
    if current == 0 {
        return None;
    }
    let remaining = u128::from(total.saturating_sub(current));
    let nanos = elapsed.as_nanos() * remaining / u128::from(current);
    Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
}

/// `{pct}`: percent rounded down, so 100 shows only at the total.
fn write_percent(state: &indicatif::ProgressState, w: &mut dyn fmt::Write) {
    let percent = state.len().map_or(0, |len| floor_percent(state.pos(), len));
    let _ = write!(w, "{percent:>3}");
}

/// `{eta_left}`: linear estimate from the average pace so far.
fn write_eta(state: &indicatif::ProgressState, w: &mut dyn fmt::Write) {
    let eta = state
        .len()
        .and_then(|len| estimate_remaining(state.elapsed(), state.pos(), len));
    let _ = match eta {
        Some(eta) => write!(w, "{}", FormattedDuration(eta)),
        None => w.write_str("--:--"),
    };
}

fn bar_style(total: Option<u64>, bar_width: usize) -> ProgressStyle {
    let template = match total {
        Some(_) => format!(
            "[{{bar:{}}}] {{pct}}% {{pos}}/{{len}} {{elapsed_precise}} ETA {{eta_left}} {{msg}}",
            bar_width.max(1)
        ),
        None => "{spinner} {pos} {elapsed_precise} {msg}".to_string(),
    };
    match ProgressStyle::with_template(&template) {
        Ok(style) => style
            .progress_chars("=> ")
            .tick_strings(SPINNER_FRAMES)
            .with_key("pct", write_percent)
            .with_key("eta_left", write_eta),
        Err(e) => {
            tracing::debug!("invalid progress template {:?}: {}", template, e);
            ProgressStyle::default_bar()
        }
    }
}

/// Redraws per second allowed by `throttle`.
fn refresh_rate(throttle: Duration) -> u8 {
    let per_second = 1000 / throttle.as_millis().max(1);
    u8::try_from(per_second.clamp(1, u128::from(u8::MAX))).unwrap_or(u8::MAX)
}

/// indicatif draw target that turns each frame into the session's live line.
///
/// Cursor movement is ignored: the session positions the live line itself,
/// either in place or in the last header row of a reserved region.
struct SessionTerm {
    state: Arc<Mutex<TerminalState>>,
    owner: u64,
    label: String,
    closed: Arc<AtomicBool>,
    frame: Mutex<String>,
}

impl fmt::Debug for SessionTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTerm")
            .field("owner", &self.owner)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl TermLike for SessionTerm {
    fn width(&self) -> u16 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .caps
            .width
    }

    fn move_cursor_up(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn move_cursor_down(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn move_cursor_right(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn move_cursor_left(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn write_line(&self, s: &str) -> io::Result<()> {
        self.write_str(s)?;
        self.write_str("\n")
    }

    fn write_str(&self, s: &str) -> io::Result<()> {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(s);
        Ok(())
    }

    fn clear_line(&self) -> io::Result<()> {
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let frame = std::mem::take(&mut *self.frame.lock().unwrap_or_else(PoisonError::into_inner));
        let Some(text) = frame.lines().map(str::trim_end).find(|line| !line.is_empty()) else {
            return Ok(());
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so a late frame cannot outlive `finish`
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        state.show_live(self.owner, Line::Status(StatusMessage::info(&self.label, text)));
        Ok(())
    }
}

/// A running progress operation.
///
/// Dropping an unfinished handle removes the live line and releases a pinned
/// region without printing anything.
#[derive(Debug)]
pub struct ProgressHandle<'s> {
    session: &'s TerminalSession,
    id: u64,
    display: ProgressDisplay,
    state: ProgressState,
    bar: ProgressBar,
    closed: Arc<AtomicBool>,
    region: Option<ScrollRegion<'s>>,
    last_bucket: u64,
    last_line: Option<Instant>,
    final_rendered: bool,
    finished: bool,
}

impl<'s> ProgressHandle<'s> {
    fn start(
        session: &'s TerminalSession,
        label: String,
        total: Option<u64>,
        region: Option<ScrollRegion<'s>>,
    ) -> Self {
        let config = session.config();
        let id = session.next_id();
        let display = session.progress_display();
        let closed = Arc::new(AtomicBool::new(false));

        let target = match display {
            ProgressDisplay::InPlace => ProgressDrawTarget::term_like_with_hz(
                Box::new(SessionTerm {
                    state: session.shared_state(),
                    owner: id,
                    label: label.clone(),
                    closed: Arc::clone(&closed),
                    frame: Mutex::new(String::new()),
                }),
                refresh_rate(config.throttle),
            ),
            ProgressDisplay::Lines | ProgressDisplay::Milestones | ProgressDisplay::Hidden => {
                ProgressDrawTarget::hidden()
            }
        };
        let bar = ProgressBar::with_draw_target(total, target)
            .with_style(bar_style(total, config.bar_width));

        let shown = display;
        tracing::debug!("progress started: {} total={:?} display={:?}", label, total, shown);
        let mut handle = Self {
            session,
            id,
            display,
            state: ProgressState::new(label, total),
            bar,
            closed,
            region,
            last_bucket: 0,
            last_line: None,
            final_rendered: false,
            finished: false,
        };
        match display {
            ProgressDisplay::InPlace => {
                handle.bar.tick();
                if total.is_none() {
                    handle.bar.enable_steady_tick(SPINNER_TICK);
                }
            }
            ProgressDisplay::Lines => handle.write_line(Instant::now()),
            ProgressDisplay::Milestones | ProgressDisplay::Hidden => {}
        }
        handle
    }

    /// Current counters.
    #[must_use]
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// How this operation is displayed, fixed when it started.
    #[must_use]
    pub fn display(&self) -> ProgressDisplay {
        self.display
    }

    /// Time since the operation started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.bar.elapsed()
    }

    /// Set the completed count.
    pub fn update(&mut self, current: u64) {
        if !self.state.advance_to(current) {
            tracing::trace!(
                "ignoring backwards progress update {} < {}",
                current,
                self.state.current
            );
            return;
        }
        self.bar.set_position(self.state.current);
        self.redraw();
    }

    /// Add `delta` to the completed count.
    pub fn inc(&mut self, delta: u64) {
        self.update(self.state.current.saturating_add(delta));
    }

    /// Replace the message shown after the counters, e.g. the item being
    /// worked on.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.state.message = message.into();
        self.bar.set_message(self.state.message.clone());
    }

    /// Pick up a resized terminal and redraw if due without changing the
    /// count.
    pub fn tick(&mut self) {
        if self.display == ProgressDisplay::InPlace {
            self.session.sync_size();
            self.bar.tick();
        }
        self.redraw();
    }

    /// Finish with `message` as the single permanent line.
    pub fn finish(mut self, message: &StatusMessage) {
        self.finished = true;
        self.close();
        if let Some(region) = self.region.take() {
            region.release();
        }
        self.session.emit(message);
        tracing::debug!(
            "progress finished: {} at {} after {:?}",
            self.state.label,
            self.state.current,
            self.bar.elapsed()
        );
    }

    /// Stop drawing and take the live line off the screen.
    fn close(&mut self) {
        self.bar.disable_steady_tick();
        self.closed.store(true, Ordering::SeqCst);
        self.session.clear_live(self.id);
    }

    fn redraw(&mut self) {
        let now = Instant::now();
        let final_due = self.state.is_complete() && !self.final_rendered;

        match self.display {
            ProgressDisplay::Hidden => {}
            // indicatif throttles in-place frames; finishing the bar forces
            // the last one out.
            ProgressDisplay::InPlace => {
                if final_due {
                    self.bar.finish();
                    self.final_rendered = true;
                }
            }
            ProgressDisplay::Lines => {
                let interval = self.session.config().milestone_interval;
                let due = self
                    .last_line
                    .map_or(true, |last| now.duration_since(last) >= interval);
                if final_due || due {
                    self.write_line(now);
                }
            }
            ProgressDisplay::Milestones => {
                if final_due || self.milestone_due(now) {
                    self.write_milestone(now);
                }
            }
        }
    }

    fn milestone_due(&self, now: Instant) -> bool {
        let config = self.session.config();
        match self.state.percent() {
            Some(percent) => {
                u64::from(percent) / u64::from(config.milestone_percent.max(1)) > self.last_bucket
            }
            None => {
                let since = self
                    .last_line
                    .map_or_else(|| self.bar.elapsed(), |last| now.duration_since(last));
                since >= config.milestone_interval
            }
        }
    }

    /// A full plain progress line, for streams that cannot redraw.
    fn write_line(&mut self, now: Instant) {
        let elapsed = FormattedDuration(self.bar.elapsed());
        let mut text = match (self.state.total, self.state.percent()) {
            (Some(total), Some(percent)) => {
                format!("{percent:>3}% {}/{total} {elapsed}", self.state.current)
            }
            _ => format!("{} {elapsed}", self.state.current),
        };
        self.push_message(&mut text);
        self.session.emit(&StatusMessage::info(&self.state.label, text));
        self.mark_written(now);
    }

    fn write_milestone(&mut self, now: Instant) {
        let mut text = match (self.state.total, self.state.percent()) {
            (Some(total), Some(percent)) => {
                format!("{percent}% ({}/{total})", self.state.current)
            }
            _ => format!(
                "{} so far ({} elapsed)",
                self.state.current,
                HumanDuration(self.bar.elapsed())
            ),
        };
        self.push_message(&mut text);
        self.session.emit(&StatusMessage::info(&self.state.label, text));
        let step = u64::from(self.session.config().milestone_percent.max(1));
        self.last_bucket = self.state.percent().map_or(0, |p| u64::from(p) / step);
        self.mark_written(now);
    }

    fn push_message(&self, text: &mut String) {
        if !self.state.message.is_empty() {
            text.push(' ');
            text.push_str(&self.state.message);
        }
    }

    fn mark_written(&mut self, now: Instant) {
        self.last_line = Some(now);
        if self.state.is_complete() {
            self.final_rendered = true;
        }
    }
}

impl Drop for ProgressHandle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.close();
        if let Some(region) = self.region.take() {
            region.release();
        }
    }
}

impl TerminalSession {
    /// Start a progress operation. `None` for `total` shows a spinner that
    /// keeps moving between updates.
    pub fn start_progress(&self, label: impl Into<String>, total: Option<u64>) -> ProgressHandle<'_> {
        ProgressHandle::start(self, label.into(), total, None)
    }

    /// Start a progress operation pinned to its own header region, with
    /// status lines above the progress row and the screen below free for
    /// other output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionActive`](crate::Error::RegionActive) if a
    /// region is already reserved.
    pub fn start_progress_pinned(
        &self,
        label: impl Into<String>,
        total: Option<u64>,
    ) -> Result<ProgressHandle<'_>> {
        let region = self.reserve(PINNED_HEADER_ROWS)?;
        Ok(ProgressHandle::start(self, label.into(), total, Some(region)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capabilities, ProgressMode, TerminalSize};
    use crate::error::Error;
    use crate::session::SessionConfig;
    use crate::test_support::{ansi_session, plain_session, screen, test_config, SharedBuffer};

    fn session_with(caps: Capabilities, config: SessionConfig) -> (TerminalSession, SharedBuffer) {
        let out = SharedBuffer::default();
        let session = TerminalSession::with_writer(out.clone(), caps, config);
        (session, out)
    }

    #[test]
    fn test_percent_is_monotone_and_exact_at_total() {
        let mut state = ProgressState::new("x", Some(3));
        let mut seen = vec![state.percent().unwrap()];
        for current in 1..=3 {
            assert!(state.advance_to(current));
            seen.push(state.percent().unwrap());
        }
        assert_eq!(seen, vec![0, 33, 66, 100]);
        assert!(state.is_complete());

        let empty = ProgressState::new("x", Some(0));
        assert_eq!(empty.percent(), Some(100));
        assert_eq!(ProgressState::new("x", None).percent(), None);
    }

    #[test]
    fn test_advance_ignores_backwards_and_clamps() {
        let mut state = ProgressState::new("x", Some(10));
        assert!(state.advance_to(5));
        assert!(!state.advance_to(3));
        assert_eq!(state.current(), 5);
        assert!(state.advance_to(50));
        assert_eq!(state.current(), 10);
    }

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0, 4), None);
        assert_eq!(
            estimate_remaining(Duration::from_secs(10), 1, 4),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            estimate_remaining(Duration::from_secs(10), 4, 4),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_refresh_rate_from_throttle() {
        assert_eq!(refresh_rate(Duration::from_millis(100)), 10);
        assert_eq!(refresh_rate(Duration::ZERO), u8::MAX);
        assert_eq!(refresh_rate(Duration::from_secs(3600)), 1);
    }

    #[test]
    fn test_in_place_progress_then_finish() {
        let (session, out) = ansi_session(24, 80);
        let mut progress = session.start_progress("Downloading", Some(4));
        assert_eq!(progress.display(), ProgressDisplay::InPlace);
        progress.update(2);
        {
            let parser = screen(&out.contents(), 24, 80);
            let row = parser.screen().rows(0, 80).next().unwrap();
            assert!(row.contains("Downloading ["));
            assert!(row.contains(" 50% 2/4"));
            assert!(row.contains("ETA"));
        }

        progress.finish(&StatusMessage::success("Downloaded", "4 crates"));
        let parser = screen(&out.contents(), 24, 80);
        let rows: Vec<String> = parser.screen().rows(0, 80).collect();
        assert_eq!(rows[0], "  Downloaded 4 crates");
        assert!(rows[1].is_empty());
    }

    #[test]
    fn test_in_place_updates_are_throttled() {
        let (session, out) = session_with(
            Capabilities::interactive(TerminalSize::default()),
            test_config().throttle(Duration::from_secs(3600)),
        );
        let mut progress = session.start_progress("Checking", Some(1000));
        for current in 1..1000 {
            progress.update(current);
        }
        assert!(out.text().matches("Checking").count() < 100);

        progress.update(1000);
        assert!(out.text().contains("100% 1000/1000"));
        progress.finish(&StatusMessage::success("Checked", "1000 files"));
    }

    #[test]
    fn test_set_message_shows_in_live_line() {
        let (session, out) = ansi_session(24, 80);
        let mut progress = session.start_progress("Compiling", Some(3));
        progress.set_message("serde");
        progress.update(1);
        assert_eq!(progress.state().message(), "serde");

        let parser = screen(&out.contents(), 24, 80);
        let row = parser.screen().rows(0, 80).next().unwrap();
        assert!(row.contains("1/3"));
        assert!(row.ends_with("serde"));
    }

    #[test]
    fn test_spinner_moves_without_updates() {
        let (session, out) = ansi_session(24, 80);
        let progress = session.start_progress("Waiting", None);
        std::thread::sleep(Duration::from_millis(450));

        let text = out.text();
        assert!(SPINNER_FRAMES.iter().any(|frame| text.contains(frame)));
        assert!(text.contains(" 0 00:00:0"));
        assert!(text.matches("Waiting").count() >= 3);
        drop(progress);
        assert!(session.lock().live.is_none());
    }

    #[test]
    fn test_no_frames_after_finish() {
        let (session, out) = ansi_session(24, 80);
        let progress = session.start_progress("Waiting", None);
        std::thread::sleep(Duration::from_millis(150));
        progress.finish(&StatusMessage::success("Done", "waiting"));

        let len = out.contents().len();
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(out.contents().len(), len);
        assert!(session.lock().live.is_none());
    }

    #[test]
    fn test_milestones_on_plain_stream() {
        let (session, out) = plain_session();
        let mut progress = session.start_progress("Indexing", Some(100));
        for current in 1..=100 {
            progress.update(current);
        }
        progress.finish(&StatusMessage::success("Indexed", "100 files"));

        let text = out.text();
        assert!(!text.contains('\x1b'));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "    Indexing 10% (10/100)");
        assert_eq!(lines[9], "    Indexing 100% (100/100)");
        assert_eq!(lines[10], "     Indexed 100 files");
    }

    #[test]
    fn test_milestones_carry_message() {
        let (session, out) = plain_session();
        let mut progress = session.start_progress("Indexing", Some(10));
        progress.set_message("src/lib.rs");
        progress.update(10);
        assert_eq!(out.text(), "    Indexing 100% (10/10) src/lib.rs\n");
    }

    #[test]
    fn test_always_on_plain_stream_writes_lines() {
        let (session, out) = session_with(
            Capabilities::plain(TerminalSize::default()),
            test_config().progress_mode(ProgressMode::Always),
        );
        let mut progress = session.start_progress("Fetching", Some(2));
        progress.update(1);
        progress.update(2);
        progress.finish(&StatusMessage::success("Fetched", "2 items"));

        let text = out.text();
        assert!(!text.contains('\x1b'));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("  0% 0/2"));
        assert!(lines[1].contains("100% 2/2"));
    }

    #[test]
    fn test_display_fixed_at_start() {
        let (session, out) = ansi_session(24, 80);
        let mut progress = session.start_progress("Linking", Some(2));
        session.lock().caps.degrade();
        progress.update(2);
        assert_eq!(progress.display(), ProgressDisplay::InPlace);
        assert_eq!(session.progress_display(), ProgressDisplay::Milestones);
        progress.finish(&StatusMessage::success("Linked", "app"));
        assert!(out.text().ends_with("Linked app\n"));
    }

    #[test]
    fn test_quiet_hides_progress() {
        let (session, out) = session_with(
            Capabilities::interactive(TerminalSize::default()),
            test_config().quiet(true),
        );
        let mut progress = session.start_progress("Building", Some(2));
        progress.update(2);
        progress.finish(&StatusMessage::error("Error", "build failed"));
        assert_eq!(out.text().lines().count(), 1);
        assert!(out.text().contains("build failed"));
    }

    #[test]
    fn test_pinned_progress_owns_region() {
        let (session, out) = ansi_session(24, 80);
        let mut progress = session.start_progress_pinned("Testing", Some(3)).unwrap();
        assert!(session.region_active());
        assert!(matches!(
            session.start_progress_pinned("Other", None),
            Err(Error::RegionActive)
        ));

        session.info("Running", "unit tests");
        progress.update(1);
        {
            let parser = screen(&out.contents(), 24, 80);
            let rows: Vec<String> = parser.screen().rows(0, 80).collect();
            assert!(rows[0].contains("Running unit tests"));
            assert!(rows[1].contains("Testing ["));
        }

        progress.finish(&StatusMessage::success("Finished", "3 tests"));
        assert!(!session.region_active());
        let text = out.text();
        let reset = text.rfind("\x1b[r").unwrap();
        assert!(text[reset..].contains("Finished 3 tests"));
    }

    #[test]
    fn test_dropped_handle_releases_region() {
        let (session, _out) = ansi_session(24, 80);
        {
            let mut progress = session.start_progress_pinned("Testing", None).unwrap();
            progress.inc(1);
        }
        assert!(!session.region_active());
        assert!(session.lock().live.is_none());
    }
}
