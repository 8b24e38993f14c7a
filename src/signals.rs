//! Signals received while a child runs.
//!
//! Interrupts and termination requests are forwarded to the PTY child, which
//! lives in its own session and would otherwise never see them. Window
//! changes resize the child's PTY.
//!
//! Signal handlers cannot be uninstalled, so a single dispatcher thread owns
//! them for the life of the process. It routes each signal to the listeners
//! of the runs in progress and, when there are none, applies the default
//! action so the host still stops on Ctrl-C.

#[cfg(unix)]
use std::ffi::c_int;
use std::io;
#[cfg(unix)]
use std::sync::{Mutex, MutexGuard, PoisonError};

use portable_pty::ChildKiller;
#[cfg(unix)]
use tokio::sync::mpsc;

/// A signal delivered to this process during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignalEvent {
    Interrupt,
    Terminate,
    WindowChange,
}

/// Listeners currently taking signals, and whether the dispatcher thread is
/// running.
#[cfg(unix)]
struct Routes {
    installed: bool,
    next_id: u64,
    listeners: Vec<(u64, mpsc::UnboundedSender<SignalEvent>)>,
}

#[cfg(unix)]
static ROUTES: Mutex<Routes> = Mutex::new(Routes {
    installed: false,
    next_id: 0,
    listeners: Vec::new(),
});

#[cfg(unix)]
fn routes() -> MutexGuard<'static, Routes> {
    ROUTES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives signals for the duration of one run.
#[cfg(unix)]
pub(crate) struct SignalListener {
    id: u64,
    events: mpsc::UnboundedReceiver<SignalEvent>,
}

#[cfg(unix)]
impl SignalListener {
    /// Start listening. The first listener installs the process-wide
    /// dispatcher; while no listener exists SIGINT and SIGTERM keep their
    /// default action.
    pub(crate) fn new() -> io::Result<Self> {
        let mut routes = routes();
        if !routes.installed {
            install_dispatcher()?;
            routes.installed = true;
        }
        let (tx, events) = mpsc::unbounded_channel();
        let id = routes.next_id;
        routes.next_id += 1;
        routes.listeners.push((id, tx));
        Ok(Self { id, events })
    }

    pub(crate) async fn recv(&mut self) -> SignalEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}

#[cfg(unix)]
impl Drop for SignalListener {
    fn drop(&mut self) {
        routes().listeners.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(unix)]
fn install_dispatcher() -> io::Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGWINCH};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGWINCH])?;
    std::thread::Builder::new()
        .name("signal-dispatch".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                dispatch(signal);
            }
        })?;
    tracing::debug!("signal dispatcher installed");
    Ok(())
}

#[cfg(unix)]
fn event_for(signal: c_int) -> Option<SignalEvent> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGWINCH};

    match signal {
        SIGINT => Some(SignalEvent::Interrupt),
        SIGTERM => Some(SignalEvent::Terminate),
        SIGWINCH => Some(SignalEvent::WindowChange),
        _ => None,
    }
}

/// Hand `event` to every live listener. Returns `false` when none took it.
#[cfg(unix)]
fn deliver(event: SignalEvent) -> bool {
    let routes = routes();
    let mut delivered = false;
    for (_, tx) in &routes.listeners {
        delivered |= tx.send(event).is_ok();
    }
    delivered
}

#[cfg(unix)]
fn dispatch(signal: c_int) {
    let Some(event) = event_for(signal) else {
        return;
    };
    if deliver(event) || event == SignalEvent::WindowChange {
        return;
    }
    tracing::debug!("no run in progress, applying the default action for signal {}", signal);
    if let Err(e) = signal_hook::low_level::emulate_default_handler(signal) {
        tracing::warn!("failed to apply the default action for signal {}: {}", signal, e);
    }
}

#[cfg(not(unix))]
pub(crate) struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self)
    }

    pub(crate) async fn recv(&mut self) -> SignalEvent {
        match tokio::signal::ctrl_c().await {
            Ok(()) => SignalEvent::Interrupt,
            Err(e) => {
                tracing::debug!("ctrl-c listener unavailable: {}", e);
                std::future::pending().await
            }
        }
    }
}

/// Pass `event` on to the child. Falls back to killing it when the signal
/// cannot be delivered.
#[cfg(unix)]
pub(crate) fn forward(pid: Option<u32>, killer: &mut dyn ChildKiller, event: SignalEvent) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match event {
        SignalEvent::Interrupt => Signal::SIGINT,
        SignalEvent::Terminate => Signal::SIGTERM,
        SignalEvent::WindowChange => return,
    };

    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => {
                tracing::debug!("forwarded {:?} to child {}", signal, pid);
                return;
            }
            Err(e) => tracing::debug!("failed to forward {:?} to child {}: {}", signal, pid, e),
        }
    }
    if let Err(e) = killer.kill() {
        tracing::debug!("failed to kill child: {}", e);
    }
}

#[cfg(not(unix))]
pub(crate) fn forward(_pid: Option<u32>, killer: &mut dyn ChildKiller, event: SignalEvent) {
    if event == SignalEvent::WindowChange {
        return;
    }
    if let Err(e) = killer.kill() {
        tracing::debug!("failed to kill child: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use portable_pty::{native_pty_system, CommandBuilder, PtySize};

    use super::*;
    use crate::test_support::exclusive_run;

    fn is_listening(id: u64) -> bool {
        routes().listeners.iter().any(|(listener, _)| *listener == id)
    }

    #[tokio::test]
    async fn test_listener_is_scoped() {
        let _exclusive = exclusive_run().await;
        let listener = SignalListener::new().unwrap();
        let id = listener.id;
        assert!(routes().installed);
        assert!(is_listening(id));

        drop(listener);
        assert!(!is_listening(id));
    }

    #[tokio::test]
    async fn test_listener_receives_delivered_events() {
        let _exclusive = exclusive_run().await;
        let mut listener = SignalListener::new().unwrap();
        assert!(deliver(SignalEvent::WindowChange));
        let event = tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .unwrap();
        assert_eq!(event, SignalEvent::WindowChange);
    }

    #[test]
    fn test_signal_mapping() {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGWINCH};

        assert_eq!(event_for(SIGINT), Some(SignalEvent::Interrupt));
        assert_eq!(event_for(SIGTERM), Some(SignalEvent::Terminate));
        assert_eq!(event_for(SIGWINCH), Some(SignalEvent::WindowChange));
        assert_eq!(event_for(SIGHUP), None);
    }

    #[test]
    fn test_forward_interrupt_stops_child() {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut cmd = CommandBuilder::new("sleep");
        cmd.arg("30");
        let mut child = pair.slave.spawn_command(cmd).unwrap();
        drop(pair.slave);

        let mut killer = child.clone_killer();
        std::thread::sleep(Duration::from_millis(100));
        forward(child.process_id(), &mut *killer, SignalEvent::Interrupt);

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_window_change_is_not_forwarded() {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut child = pair
            .slave
            .spawn_command(CommandBuilder::new("true"))
            .unwrap();
        drop(pair.slave);

        let mut killer = child.clone_killer();
        forward(child.process_id(), &mut *killer, SignalEvent::WindowChange);
        assert!(child.wait().unwrap().success());
    }
}
