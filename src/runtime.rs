//! Process-wide stop flag for long-running commands (`watch-price`).

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Latching stop flag. Clones share state; once set it stays set.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self { Self::new() }
}

impl Shutdown {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    pub fn trigger(&self) {
        self.flag.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Returns immediately when the flag is already set.
    pub async fn wait(&self) {
        let mut rx = self.flag.subscribe();
        // Err only if the sender is gone, which cannot happen while `self` holds it.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Set the returned flag on SIGINT/SIGTERM (Ctrl+C off unix).
pub fn install_signal_handlers() -> Shutdown {
    let shutdown = Shutdown::new();
    let handle = shutdown.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut term), Ok(mut int)) => {
                    let name = tokio::select! {
                        _ = term.recv() => "SIGTERM",
                        _ = int.recv() => "SIGINT",
                    };
                    info!(signal = name, "Stopping");
                }
                _ => {
                    warn!("Unix signals unavailable, listening for Ctrl+C");
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl+C listener unavailable");
                return;
            }
            info!(signal = "ctrl-c", "Stopping");
        }

        handle.trigger();
    });

    shutdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_wake_once_flag_is_set() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(shutdown.is_triggered());

        shutdown.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_triggered() {
        let shutdown = Shutdown::new();
        assert!(tokio::time::timeout(Duration::from_millis(20), shutdown.wait()).await.is_err());
    }
}
