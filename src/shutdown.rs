//! One-shot, idempotent shutdown broadcast shared by every long-running task
//! (supervisor, exporter, governor, and one parser per spool).
//!
//! Grounded on the `tokio::sync::watch` shutdown pattern used by
//! `other_examples/.../tailer.rs.rs` (`shutdown_rx.changed()` inside
//! `tokio::select!`), generalized into a small reusable handle so every task
//! in `logflowd` shares the exact same idiom instead of re-deriving it.

use tokio::sync::watch;

/// Held by `main` (and whoever else needs to trigger shutdown). Calling
/// [`ShutdownTx::shutdown`] more than once is harmless — `watch` coalesces.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

/// Cloned into every task that must stop cleanly on shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownTx {
    pub fn new() -> (Self, ShutdownRx) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), ShutdownRx(rx))
    }

    /// Broadcasts shutdown to every outstanding `ShutdownRx`. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

impl ShutdownRx {
    /// True once shutdown has been signaled; never reverts to false.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been signaled. Safe to await from inside a
    /// `tokio::select!` arm alongside other work.
    pub async fn signaled(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                // Sender dropped without ever signaling; treat as shutdown
                // so tasks don't spin forever against a dead handle.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signaled_resolves_after_shutdown() {
        let (tx, mut rx) = ShutdownTx::new();
        assert!(!rx.is_shutdown());
        tx.shutdown();
        rx.signaled().await;
        assert!(rx.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (tx, rx) = ShutdownTx::new();
        tx.shutdown();
        tx.shutdown();
        assert!(rx.is_shutdown());
    }

    #[tokio::test]
    async fn clones_observe_the_same_signal() {
        let (tx, rx) = ShutdownTx::new();
        let mut rx2 = rx.clone();
        tx.shutdown();
        rx2.signaled().await;
        assert!(rx2.is_shutdown());
    }
}
