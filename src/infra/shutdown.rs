//! Process-wide shutdown signal
//!
//! `main` owns the `watch::Sender<bool>`; every long-running loop holds a
//! receiver and selects on `signalled` at its natural checkpoints.

use tokio::sync::watch;

pub type ShutdownRx = watch::Receiver<bool>;

/// Resolves once shutdown is requested. A dropped sender counts as shutdown.
pub async fn signalled(shutdown: &mut ShutdownRx) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
