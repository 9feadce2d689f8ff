use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::{Reconciler, SyncContext};
use core_model::SyncError;

/// Stops a running [`Reconciler::watch`] loop.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. A dropped handle never cancels.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Reconciler<'_> {
    /// Runs a cycle immediately and then every `every` until cancelled.
    ///
    /// Cancellation is only observed between cycles, so an in-flight cycle
    /// always finishes. A cycle that fails outright ends the loop with its
    /// error. Returns the number of completed cycles.
    pub async fn watch(
        &mut self,
        ctx: &mut SyncContext,
        every: Duration,
        mut token: CancelToken,
    ) -> Result<usize, SyncError> {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let summary = self.run_cycle(ctx).await?;
            cycles += 1;
            info!(cycle = cycles, %summary, "watch cycle finished");
            if token.is_cancelled() {
                break;
            }
        }
        info!(cycles, "watch stopped");
        Ok(cycles)
    }
}
