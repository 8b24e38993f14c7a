//! Control sequences crossterm does not ship, and a filter that strips
//! escape sequences from child output on plain streams.

use std::fmt;

use vte::{Params, Parser, Perform};

/// DECSTBM: restrict scrolling to rows `top..=bottom` (1-indexed).
///
/// Terminals move the cursor to the home position after this sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetScrollMargins {
    /// First row of the scrolling band.
    pub top: u16,
    /// Last row of the scrolling band.
    pub bottom: u16,
}

impl crossterm::Command for SetScrollMargins {
    fn write_ansi(&self, f: &mut impl fmt::Write) -> fmt::Result {
        write!(f, "\x1b[{};{}r", self.top, self.bottom)
    }

    #[cfg(windows)]
    fn execute_winapi(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "scroll margins require ANSI support",
        ))
    }
}

/// DECSTBM without parameters: scrolling covers the full screen again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetScrollMargins;

impl crossterm::Command for ResetScrollMargins {
    fn write_ansi(&self, f: &mut impl fmt::Write) -> fmt::Result {
        f.write_str("\x1b[r")
    }

    #[cfg(windows)]
    fn execute_winapi(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "scroll margins require ANSI support",
        ))
    }
}

/// Removes escape sequences from a byte stream and folds `\r\n` into `\n`.
///
/// Parser state survives across calls, so a sequence split between two PTY
/// reads is still removed.
pub(crate) struct PlainFilter {
    parser: Parser,
    sink: PlainSink,
}

impl PlainFilter {
    pub(crate) fn new() -> Self {
        Self {
            parser: Parser::new(),
            sink: PlainSink::default(),
        }
    }

    /// Feed raw bytes, returning the printable part.
    pub(crate) fn filter(&mut self, data: &[u8]) -> Vec<u8> {
        for &byte in data {
            self.parser.advance(&mut self.sink, byte);
        }
        std::mem::take(&mut self.sink.out)
    }
}

#[derive(Default)]
struct PlainSink {
    out: Vec<u8>,
    pending_cr: bool,
}

impl PlainSink {
    fn flush_cr(&mut self) {
        if self.pending_cr {
            self.out.push(b'\r');
            self.pending_cr = false;
        }
    }
}

impl Perform for PlainSink {
    fn print(&mut self, c: char) {
        self.flush_cr();
        let mut utf8 = [0u8; 4];
        self.out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.pending_cr = false;
                self.out.push(b'\n');
            }
            b'\r' => {
                self.flush_cr();
                self.pending_cr = true;
            }
            b'\t' => {
                self.flush_cr();
                self.out.push(b'\t');
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

#[cfg(test)]
mod tests {
    use crossterm::Command;

    use super::*;

    fn ansi(command: &impl Command) -> String {
        let mut s = String::new();
        command.write_ansi(&mut s).unwrap();
        s
    }

    #[test]
    fn test_scroll_margin_sequences() {
        assert_eq!(ansi(&SetScrollMargins { top: 2, bottom: 24 }), "\x1b[2;24r");
        assert_eq!(ansi(&ResetScrollMargins), "\x1b[r");
    }

    #[test]
    fn test_filter_strips_sgr_and_crlf() {
        let mut filter = PlainFilter::new();
        let out = filter.filter(b"\x1b[1;31merror\x1b[0m: boom\r\nnext");
        assert_eq!(out, b"error: boom\nnext");
    }

    #[test]
    fn test_filter_handles_split_sequences() {
        let mut filter = PlainFilter::new();
        let mut out = filter.filter(b"a\x1b[3");
        out.extend(filter.filter(b"2mb\x1b]0;title\x07c"));
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_filter_keeps_lone_carriage_return() {
        let mut filter = PlainFilter::new();
        assert_eq!(filter.filter(b" 10%\r 20%\r\n"), b" 10%\r 20%\n");
    }

    #[test]
    fn test_filter_keeps_utf8() {
        let mut filter = PlainFilter::new();
        assert_eq!(filter.filter("构建 ✓\r\n".as_bytes()), "构建 ✓\n".as_bytes());
    }
}
