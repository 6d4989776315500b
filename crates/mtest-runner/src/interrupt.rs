//! Run-scoped user interrupt.
//!
//! One listener is installed per run. Once Ctrl-C has been seen the signal
//! stays raised, so every later wait point observes it too.

use std::fmt;

use tokio::sync::watch;
use tracing::warn;

/// Cheaply clonable view of the run's interrupt state.
#[derive(Clone)]
pub struct InterruptSignal {
    rx: watch::Receiver<bool>,
}

impl InterruptSignal {
    /// Start listening for SIGINT / Ctrl-C.
    ///
    /// The listener is registered before this returns, so an interrupt
    /// arriving right afterwards is not missed. Must be called from within
    /// a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        let (tx, rx) = watch::channel(false);
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt())?;
            tokio::spawn(async move {
                if sigint.recv().await.is_some() {
                    warn!("interrupt received; stopping the run");
                    let _ = tx.send(true);
                }
            });
        }
        #[cfg(not(unix))]
        {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping the run");
                    let _ = tx.send(true);
                }
            });
        }
        Ok(Self { rx })
    }

    /// A signal that never fires.
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the interrupt has been raised; pending forever for a
    /// signal that can no longer fire.
    pub async fn raised(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for InterruptSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}
