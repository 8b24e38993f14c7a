//! PTY spawning and the subprocess runner.
//!
//! The child writes into a PTY; a blocking copier task moves its output to
//! the foreground over a bounded channel, and the foreground writes it to
//! the terminal through the session lock. Nothing else writes body content.

use std::io::{self, Read};
use std::time::Instant;

use portable_pty::{native_pty_system, Child, ChildKiller, ExitStatus, MasterPty, PtyPair, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ansi::PlainFilter;
use crate::capability::TerminalSize;
use crate::error::{Error, Result};
use crate::session::TerminalSession;
use crate::signals::{self, SignalEvent, SignalListener};
use crate::subprocess::{RunState, SpawnConfig, SubprocessResult};

/// Chunks buffered between the copier and the foreground writer.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// A child running in a PTY.
pub(crate) struct SubprocessHandle {
    /// Process id, if the platform reports one.
    pid: Option<u32>,

    /// PTY master, kept open until output is drained.
    master: Box<dyn MasterPty + Send>,

    /// Kills the child if the run ends before it exits.
    killer: Box<dyn ChildKiller + Send + Sync>,

    /// Raw exit status once the child has exited.
    exit_code: Option<u32>,

    /// Output chunks from the copier.
    output_rx: mpsc::Receiver<Vec<u8>>,

    /// Handle to the copier task.
    copier: JoinHandle<()>,

    /// Handle to the process monitor task.
    monitor: JoinHandle<io::Result<ExitStatus>>,
}

impl SubprocessHandle {
    fn resize(&self, size: TerminalSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| Error::Resize(e.to_string()))
    }

    fn forward(&mut self, event: SignalEvent) {
        signals::forward(self.pid, &mut *self.killer, event);
    }
}

impl Drop for SubprocessHandle {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            tracing::debug!("killing unfinished child {:?}", self.pid);
            if let Err(e) = self.killer.kill() {
                tracing::debug!("failed to kill child {:?}: {}", self.pid, e);
            }
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns `config` in a new PTY of the given size.
///
/// # Errors
/// Returns an error if PTY creation or process spawning fails.
fn spawn_pty(
    session: &TerminalSession,
    config: &SpawnConfig,
    size: TerminalSize,
) -> Result<SubprocessHandle> {
    let pty_system = native_pty_system();

    let PtyPair { master, slave } = pty_system
        .openpty(pty_size(size))
        .map_err(|e| Error::PtyCreate(e.to_string()))?;
    session.set_run_state(RunState::PtyAllocated);

    let child = slave
        .spawn_command(config.command_builder())
        .map_err(|e| Error::Spawn {
            program: config.command.clone(),
            reason: e.to_string(),
        })?;
    // The reader only sees EOF once this process holds no slave handle
    drop(slave);
    session.set_run_state(RunState::ChildSpawned);

    let pid = child.process_id();
    let mut killer = child.clone_killer();
    let reader = match master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            if let Err(kill_err) = killer.kill() {
                tracing::debug!("failed to kill child {:?}: {}", pid, kill_err);
            }
            return Err(e.into());
        }
    };

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let copier = spawn_copier_task(reader, output_tx);
    let monitor = spawn_monitor_task(child);

    tracing::debug!(
        "spawned `{}` (pid {:?}) in a {}x{} PTY",
        config.command,
        pid,
        size.cols,
        size.rows
    );

    Ok(SubprocessHandle {
        pid,
        master,
        killer,
        exit_code: None,
        output_rx,
        copier,
        monitor,
    })
}

/// Spawns the task that copies PTY output to the foreground.
fn spawn_copier_task(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Linux reports EIO once the child side is closed
                    tracing::debug!("PTY read finished: {}", e);
                    break;
                }
            }
        }

        tracing::debug!("PTY copier finished");
    })
}

/// Spawns the task that waits for the child to exit.
fn spawn_monitor_task(
    mut child: Box<dyn Child + Send + Sync>,
) -> JoinHandle<io::Result<ExitStatus>> {
    tokio::task::spawn_blocking(move || child.wait())
}

/// Name of the signal that ended the child. portable-pty 0.8 only exposes it
/// through `Display`.
fn terminating_signal(status: &ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    status
        .to_string()
        .strip_prefix("Terminated by ")
        .map(ToString::to_string)
}

/// Resolves to the exit code once the drain deadline passes.
async fn drain_deadline(exited: Option<(u32, tokio::time::Instant)>) -> u32 {
    match exited {
        Some((code, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            code
        }
        None => std::future::pending().await,
    }
}

/// Shapes child output for the body: raw inside a drawn region, whole lines
/// elsewhere, free of escape sequences on plain streams.
struct BodyOutput {
    filter: Option<PlainFilter>,
    pending: Vec<u8>,
}

impl BodyOutput {
    fn new(session: &TerminalSession) -> Self {
        Self {
            filter: (!session.lock().caps.supports_ansi).then(PlainFilter::new),
            pending: Vec::new(),
        }
    }

    fn push(&mut self, session: &TerminalSession, chunk: &[u8]) {
        match &mut self.filter {
            Some(filter) => self.pending.extend(filter.filter(chunk)),
            None => self.pending.extend_from_slice(chunk),
        }

        // The region can be dropped by a resize mid-run, so decide per chunk
        let mut state = session.lock();
        let end = if state.region_active() {
            self.pending.len()
        } else {
            match self.pending.iter().rposition(|&b| b == b'\n') {
                Some(end) => end + 1,
                None => return,
            }
        };
        let rest = self.pending.split_off(end);
        let out = std::mem::replace(&mut self.pending, rest);
        state.commit(|s| s.write_body(&out));
    }

    /// Write the trailing partial line, if any.
    fn finish(&mut self, session: &TerminalSession) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            session.write_body(&rest);
        }
    }
}

/// Marks the reserved region as fed by a child while alive.
struct BodyAttachment<'s> {
    session: &'s TerminalSession,
}

impl<'s> BodyAttachment<'s> {
    fn attach(session: &'s TerminalSession) -> Result<Self> {
        let mut state = session.lock();
        if let Some(region) = &mut state.region {
            if region.streaming {
                return Err(Error::SubprocessActive);
            }
            region.streaming = true;
        }
        Ok(Self { session })
    }
}

impl Drop for BodyAttachment<'_> {
    fn drop(&mut self) {
        if let Some(region) = &mut self.session.lock().region {
            region.streaming = false;
        }
    }
}

/// Reports `Failed` when a run is dropped before it completes.
struct RunGuard<'s> {
    session: &'s TerminalSession,
    completed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.session.set_run_state(RunState::Failed);
        }
    }
}

impl TerminalSession {
    /// Run a child process in a PTY and stream its output below a pinned
    /// header until it exits.
    ///
    /// The child sees a terminal, so it keeps its colors. A region is
    /// reserved for the run unless one is already reserved (for example by a
    /// pinned progress operation), in which case the output streams into
    /// that region. Any region the run reserved is released before this
    /// returns, including when the future is dropped early.
    ///
    /// SIGINT and SIGTERM received meanwhile are forwarded to the child and
    /// the run continues until the child exits. Outside a run those signals
    /// keep their default action.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if the program cannot be started (no region
    /// is reserved in that case), [`Error::SubprocessActive`] if another
    /// child is already streaming into the reserved region, and PTY or I/O
    /// errors. A non-zero exit status is not an error.
    pub async fn run(&self, config: SpawnConfig) -> Result<SubprocessResult> {
        if self.lock().region.as_ref().is_some_and(|r| r.streaming) {
            return Err(Error::SubprocessActive);
        }

        let mut guard = RunGuard {
            session: self,
            completed: false,
        };
        self.set_run_state(RunState::Idle);
        let result = self.run_inner(&config).await;
        guard.completed = true;

        match &result {
            Ok(outcome) => {
                tracing::debug!(
                    "`{}` exited with {} after {:?}",
                    config.command,
                    outcome.exit_code,
                    outcome.duration
                );
                self.set_run_state(RunState::RegionReleased);
            }
            Err(e) => {
                tracing::debug!("running `{}` failed: {}", config.command, e);
                self.set_run_state(RunState::Failed);
            }
        }
        result
    }

    async fn run_inner(&self, config: &SpawnConfig) -> Result<SubprocessResult> {
        let base_rows = config.header_rows.unwrap_or(self.config().header_rows);
        let header_rows = base_rows.saturating_add(u16::from(self.lock().live.is_some()));
        let mut signals = SignalListener::new()?;

        let started = Instant::now();
        let spawn_size = self.body_size(header_rows);
        let mut child = spawn_pty(self, config, spawn_size)?;

        let region = match self.reserve(header_rows) {
            Ok(region) => Some(region),
            Err(Error::RegionActive) => None,
            Err(e) => return Err(e),
        };
        let attachment = BodyAttachment::attach(self)?;
        if let Some(message) = &config.status {
            self.emit(message);
        }

        let body_size = self.body_size(header_rows);
        if body_size != spawn_size {
            if let Err(e) = child.resize(body_size) {
                tracing::debug!("{}", e);
            }
        }

        self.set_run_state(RunState::Streaming);
        let mut body = BodyOutput::new(self);
        let mut output = Vec::new();
        let mut interrupted = false;
        let mut open = true;
        let mut exited: Option<(u32, tokio::time::Instant)> = None;
        let mut signal = None;
        let drain_timeout = self.config().drain_timeout;

        let exit_code = loop {
            if let (Some((code, _)), false) = (exited, open) {
                break code;
            }

            tokio::select! {
                chunk = child.output_rx.recv(), if open => match chunk {
                    Some(chunk) => {
                        output.extend_from_slice(&chunk);
                        body.push(self, &chunk);
                    }
                    None => open = false,
                },
                status = &mut child.monitor, if exited.is_none() => {
                    let status = status.map_err(|e| Error::Io(io::Error::other(e)))??;
                    let code = status.exit_code();
                    signal = terminating_signal(&status);
                    child.exit_code = Some(code);
                    self.set_run_state(RunState::Exited { code });
                    exited = Some((code, tokio::time::Instant::now() + drain_timeout));
                }
                code = drain_deadline(exited) => {
                    tracing::debug!("PTY output still open {:?} after exit", drain_timeout);
                    break code;
                }
                event = signals.recv() => match event {
                    SignalEvent::WindowChange => {
                        if self.sync_size() {
                            if let Err(e) = child.resize(self.body_size(header_rows)) {
                                tracing::debug!("{}", e);
                            }
                        }
                    }
                    SignalEvent::Interrupt | SignalEvent::Terminate => {
                        interrupted = true;
                        child.forward(event);
                    }
                },
            }
        };

        body.finish(self);
        if !child.copier.is_finished() {
            tracing::debug!("PTY copier still running after the child exited");
        }
        let duration = started.elapsed();

        drop(attachment);
        if let Some(region) = region {
            region.release();
        }

        Ok(SubprocessResult {
            exit_code,
            duration,
            output,
            interrupted,
            signal,
        })
    }

    /// PTY size for a run: the region body when one is drawn or would be.
    fn body_size(&self, header_rows: u16) -> TerminalSize {
        let state = self.lock();
        let caps = state.caps;
        let rows = match &state.region {
            Some(region) if region.active => region.body_rows(),
            Some(_) => caps.height,
            None if caps.supports_ansi && header_rows.saturating_add(1) < caps.height => {
                caps.height - header_rows
            }
            None => caps.height,
        };
        TerminalSize::new(rows.max(1), caps.width.max(1))
    }
}
