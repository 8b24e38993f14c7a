//! Scroll region reservation.
//!
//! A region pins `header_rows` status rows to the top of the screen and
//! confines scrolling to the rows below them with DECSTBM. The
//! [`ScrollRegion`] guard restores the full-screen scrolling area when it is
//! released or dropped, including during unwinding.

use std::collections::VecDeque;
use std::io::{self, Write};

use crossterm::cursor::{Hide, MoveTo, RestorePosition, SavePosition, Show};
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};

use crate::ansi::{ResetScrollMargins, SetScrollMargins};
use crate::error::{Error, Result};
use crate::session::{TerminalSession, TerminalState};
use crate::status::Line;

/// Bookkeeping for the reserved region.
#[derive(Debug)]
pub(crate) struct RegionState {
    pub(crate) id: u64,
    pub(crate) header_rows: u16,
    /// First row of the scrolling body, 1-indexed.
    pub(crate) top_row: u16,
    /// Last row of the scrolling body, 1-indexed.
    pub(crate) bottom_row: u16,
    /// Margins are currently set on the terminal.
    pub(crate) active: bool,
    /// Margins were set at least once and must be reset on release.
    pub(crate) drawn: bool,
    /// Most recent status lines, newest last.
    pub(crate) status_lines: VecDeque<Line>,
    /// A subprocess is writing into the body.
    pub(crate) streaming: bool,
}

impl RegionState {
    /// Number of rows available to the body.
    pub(crate) fn body_rows(&self) -> u16 {
        self.bottom_row.saturating_sub(self.top_row) + 1
    }
}

impl TerminalState {
    pub(crate) fn push_header(&mut self, line: Line) {
        if let Some(region) = &mut self.region {
            region.status_lines.push_back(line);
            while region.status_lines.len() > usize::from(region.header_rows) {
                region.status_lines.pop_front();
            }
        }
    }

    /// Header contents top to bottom. The live line, if any, takes the last
    /// row; status lines fill the rows above it, oldest first.
    fn header_texts(&self) -> Vec<String> {
        let Some(region) = &self.region else {
            return Vec::new();
        };
        let budget = Some(self.line_budget());
        let live = self
            .live
            .as_ref()
            .map(|(_, line)| line.render(self.label_width, true, budget));
        let status_rows = usize::from(region.header_rows) - usize::from(live.is_some());
        let skip = region.status_lines.len().saturating_sub(status_rows);

        let mut texts: Vec<String> = region
            .status_lines
            .iter()
            .skip(skip)
            .map(|line| line.render(self.label_width, true, budget))
            .collect();
        texts.resize(status_rows, String::new());
        texts.extend(live);
        texts
    }

    /// Redraw every header row, leaving the body cursor where it was.
    pub(crate) fn draw_header(&mut self) -> io::Result<()> {
        if !self.region_active() {
            return Ok(());
        }
        let texts = self.header_texts();
        queue!(self.sink, SavePosition)?;
        for (row, text) in (0u16..).zip(texts) {
            queue!(self.sink, MoveTo(0, row), Clear(ClearType::CurrentLine))?;
            self.sink.write_all(text.as_bytes())?;
        }
        queue!(self.sink, RestorePosition)
    }

    /// Push the screen into history, set the margins and draw the header.
    fn open_region(&mut self) -> io::Result<()> {
        let Some(region) = &self.region else {
            return Ok(());
        };
        let (top, bottom) = (region.top_row, region.bottom_row);
        let height = self.caps.height;

        if self.live.is_some() {
            self.erase_line()?;
        }
        queue!(self.sink, MoveTo(0, height.saturating_sub(1)))?;
        self.sink.write_all("\n".repeat(usize::from(height)).as_bytes())?;
        queue!(self.sink, SetScrollMargins { top, bottom }, Hide)?;
        self.draw_header()?;
        queue!(self.sink, MoveTo(0, top.saturating_sub(1)))?;
        self.body_mid_line = false;
        Ok(())
    }

    /// Reset the margins and put the cursor at the start of a fresh line.
    fn close_region(&mut self) -> io::Result<()> {
        queue!(self.sink, SavePosition, ResetScrollMargins, RestorePosition)?;
        if self.body_mid_line {
            self.sink.write_all(b"\r\n")?;
            self.body_mid_line = false;
        }
        queue!(self.sink, Clear(ClearType::UntilNewLine), Show)?;
        if self.caps.supports_ansi {
            self.draw_live_in_place()?;
        }
        Ok(())
    }

    /// Fit the region to the current height after a resize.
    pub(crate) fn resize_region(&mut self) -> io::Result<()> {
        let height = self.caps.height;
        let ansi = self.caps.supports_ansi;
        let Some(region) = &mut self.region else {
            return Ok(());
        };
        region.bottom_row = height;
        let top = region.top_row;

        if ansi && top < height {
            region.active = true;
            region.drawn = true;
            queue!(self.sink, SetScrollMargins { top, bottom: height })?;
            self.draw_header()?;
            queue!(self.sink, MoveTo(0, height - 1))?;
            self.body_mid_line = false;
        } else if region.active {
            region.active = false;
            queue!(self.sink, SavePosition, ResetScrollMargins, RestorePosition, Show)?;
        }
        Ok(())
    }
}

/// A reserved scroll region.
///
/// At most one exists per session. Dropping the guard releases it.
#[derive(Debug)]
#[must_use = "the region is released as soon as the guard is dropped"]
pub struct ScrollRegion<'s> {
    session: &'s TerminalSession,
    id: u64,
    header_rows: u16,
    released: bool,
}

impl ScrollRegion<'_> {
    /// Rows pinned above the body.
    #[must_use]
    pub fn header_rows(&self) -> u16 {
        self.header_rows
    }

    /// First body row, 1-indexed.
    #[must_use]
    pub fn top_row(&self) -> u16 {
        self.header_rows.saturating_add(1)
    }

    /// Last body row, 1-indexed. Follows terminal resizes.
    #[must_use]
    pub fn bottom_row(&self) -> u16 {
        self.with_state(|r| r.bottom_row).unwrap_or(0)
    }

    /// Whether the margins are currently set on the terminal. `false` on
    /// plain streams and terminals too short for a header and a body.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.with_state(|r| r.active).unwrap_or(false)
    }

    /// Show a status line in the header.
    pub fn set_status(&self, line: &str) {
        let mut state = self.session.lock();
        if state.region.as_ref().is_some_and(|r| r.id == self.id) {
            state.commit(|s| {
                s.push_header(Line::Plain(line.to_string()));
                s.draw_header()
            });
        }
    }

    /// Release the region now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn with_state<T>(&self, f: impl FnOnce(&RegionState) -> T) -> Option<T> {
        let state = self.session.lock();
        state.region.as_ref().filter(|r| r.id == self.id).map(f)
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.session.lock();
        let ours = state.region.as_ref().is_some_and(|r| r.id == self.id);
        if !ours {
            return;
        }
        let drawn = state.region.as_ref().is_some_and(|r| r.drawn);
        state.region = None;
        if drawn {
            state.commit(TerminalState::close_region);
        }
        tracing::debug!("scroll region released");
    }
}

impl Drop for ScrollRegion<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl TerminalSession {
    /// Reserve `header_rows` rows at the top of the screen for status output
    /// and confine scrolling to the rows below.
    ///
    /// On a plain stream, or a terminal too short for a header and at least
    /// one body row, the region is tracked but nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionActive`] if a region is already reserved.
    pub fn reserve(&self, header_rows: u16) -> Result<ScrollRegion<'_>> {
        let header_rows = header_rows.max(1);
        let id = self.next_id();

        let mut state = self.lock();
        if state.region.is_some() {
            return Err(Error::RegionActive);
        }
        let top_row = header_rows.saturating_add(1);
        let bottom_row = state.caps.height;
        let active = state.caps.supports_ansi && top_row < bottom_row;
        state.region = Some(RegionState {
            id,
            header_rows,
            top_row,
            bottom_row,
            active,
            drawn: active,
            status_lines: VecDeque::new(),
            streaming: false,
        });
        if active {
            state.commit(TerminalState::open_region);
        }
        tracing::debug!(
            "scroll region reserved: rows {}..={} active={}",
            top_row,
            bottom_row,
            active
        );
        drop(state);

        Ok(ScrollRegion {
            session: self,
            id,
            header_rows,
            released: false,
        })
    }
}
