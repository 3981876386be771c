//! Debounced idle synchronization

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::service::SyncService;

/// Timer that calls [`SyncService::idle_update`] after a quiet period
///
/// Every `schedule` pushes the deadline back. The timer re-arms itself for
/// as long as the service reports more work. Dropping it stops the task.
pub(crate) struct IdleUpdater {
    kick_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

impl IdleUpdater {
    pub(crate) fn start(service: Weak<SyncService>, debounce: Duration) -> Self {
        let (kick_tx, kick_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(service, debounce, kick_rx, cancel.clone()));
        Self { kick_tx, cancel }
    }

    pub(crate) fn schedule(&self) {
        let _ = self.kick_tx.send(());
    }
}

impl Drop for IdleUpdater {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    service: Weak<SyncService>,
    debounce: Duration,
    mut kick_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            kick = kick_rx.recv() => if kick.is_none() { return },
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                kick = kick_rx.recv() => match kick {
                    Some(()) => continue,
                    None => return,
                },
                _ = tokio::time::sleep(debounce) => {}
            }

            let Some(service) = service.upgrade() else {
                return;
            };
            if !service.idle_update() {
                trace!("Idle update not needed");
                break;
            }
        }
    }
}
