//! Termination controller: decides when a run stops.
//!
//! Three triggers can end a run:
//!
//! * every worker reaching its quota (observed by the driver joining them),
//! * the wall-clock deadline of a duration-bound run,
//! * an external interrupt (SIGINT, or [`InterruptHandle::interrupt`]).
//!
//! In [`InterruptSource::Process`] mode the deadline is delivered by
//! raising SIGINT against our own process, so the deadline and an operator
//! Ctrl-C travel the same path. Where raising the signal is unsupported,
//! the deadline is delivered directly.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StopCondition;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Every worker reached its quota.
    Completed,
    /// The configured duration elapsed.
    Deadline,
    /// An operator or embedding caller interrupted the run.
    Interrupted,
}

/// Where interrupts come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// Listen for the process SIGINT; the deadline raises SIGINT.
    Process,
    /// Do not touch process signals; interrupts arrive only through
    /// [`InterruptHandle`] and the deadline fires directly.
    Local,
}

/// Cloneable handle that interrupts a running controller.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        let _ = self.tx.send(Trigger::Interrupted);
    }
}

// ---------------------------------------------------------------------------
// TerminationController
// ---------------------------------------------------------------------------

pub struct TerminationController {
    stop: StopCondition,
    source: InterruptSource,
    tx: mpsc::UnboundedSender<Trigger>,
    rx: mpsc::UnboundedReceiver<Trigger>,
    deadline_elapsed: Arc<AtomicBool>,
    armed: bool,
}

impl TerminationController {
    pub fn new(stop: StopCondition, source: InterruptSource) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            stop,
            source,
            tx,
            rx,
            deadline_elapsed: Arc::new(AtomicBool::new(false)),
            armed: false,
        }
    }

    pub fn stop_condition(&self) -> StopCondition {
        self.stop
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            tx: self.tx.clone(),
        }
    }

    /// Start the signal listener (process mode) and the deadline watcher
    /// (duration mode). Calling it again is a no-op.
    ///
    /// The signal handler is installed before this returns, so a deadline
    /// raised afterwards cannot kill the process.
    pub fn arm(&mut self) -> io::Result<()> {
        if self.armed {
            return Ok(());
        }
        self.armed = true;

        let listening = match self.source {
            InterruptSource::Process => {
                self.listen_for_signals()?;
                true
            }
            InterruptSource::Local => false,
        };

        if let StopCondition::Duration(after) = self.stop {
            self.arm_deadline(after, listening);
        }
        Ok(())
    }

    /// Wait for the next trigger. Never resolves if no trigger can arrive.
    pub async fn wait(&mut self) -> Trigger {
        match self.rx.recv().await {
            Some(trigger) => trigger,
            // Unreachable while `self.tx` is alive; park rather than invent a trigger.
            None => std::future::pending().await,
        }
    }

    #[cfg(unix)]
    fn listen_for_signals(&self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = self.tx.clone();
        let deadline_elapsed = self.deadline_elapsed.clone();
        tokio::spawn(async move {
            while sigint.recv().await.is_some() {
                let trigger = if deadline_elapsed.load(Ordering::SeqCst) {
                    Trigger::Deadline
                } else {
                    Trigger::Interrupted
                };
                debug!(?trigger, "SIGINT received");
                if tx.send(trigger).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    fn listen_for_signals(&self) -> io::Result<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                debug!("Ctrl-C received");
                if tx.send(Trigger::Interrupted).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn arm_deadline(&self, after: Duration, listening: bool) {
        let tx = self.tx.clone();
        let deadline_elapsed = self.deadline_elapsed.clone();
        debug!(secs = after.as_secs(), "deadline armed");

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            deadline_elapsed.store(true, Ordering::SeqCst);
            info!(secs = after.as_secs(), "run duration elapsed");

            if listening {
                match raise_interrupt() {
                    Ok(()) => return,
                    Err(e) => warn!(error = %e, "could not raise SIGINT, stopping directly"),
                }
            }
            let _ = tx.send(Trigger::Deadline);
        });
    }
}

/// Send SIGINT to this process.
#[cfg(unix)]
fn raise_interrupt() -> io::Result<()> {
    // SAFETY: kill(2) with our own pid and a valid signal number has no
    // memory-safety preconditions.
    let rc = unsafe { libc::kill(libc::getpid(), libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn raise_interrupt() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "raising SIGINT is not supported on this platform",
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
