//! Shared helpers for unit tests: in-memory sinks and screen replay.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::capability::{Capabilities, ProgressMode, TerminalSize};
use crate::session::{SessionConfig, TerminalSession};

/// A cloneable in-memory sink.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sink whose every write fails, like a closed terminal.
pub(crate) struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Test config: explicit progress mode and no redraw throttle.
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig::default()
        .progress_mode(ProgressMode::Auto)
        .throttle(std::time::Duration::ZERO)
}

/// An interactive ANSI session of the given size.
pub(crate) fn ansi_session(rows: u16, cols: u16) -> (TerminalSession, SharedBuffer) {
    let out = SharedBuffer::default();
    let caps = Capabilities::interactive(TerminalSize::new(rows, cols));
    let session = TerminalSession::with_writer(out.clone(), caps, test_config());
    (session, out)
}

/// A non-interactive 24x80 session.
pub(crate) fn plain_session() -> (TerminalSession, SharedBuffer) {
    let out = SharedBuffer::default();
    let caps = Capabilities::plain(TerminalSize::default());
    let session = TerminalSession::with_writer(out.clone(), caps, test_config());
    (session, out)
}

/// Replay captured output on a virtual terminal.
pub(crate) fn screen(bytes: &[u8], rows: u16, cols: u16) -> vt100::Parser {
    let mut parser = vt100::Parser::new(rows, cols, 0);
    parser.process(bytes);
    parser
}

/// Serializes tests that run children, so a signal raised by one of them
/// never reaches another test's child.
pub(crate) async fn exclusive_run() -> tokio::sync::MutexGuard<'static, ()> {
    static RUNS: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());
    RUNS.lock().await
}
