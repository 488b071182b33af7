use futures::{stream, StreamExt};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::SettlementPipeline;

/// Background sweep over payments stuck in `approved`. Completion calls can
/// die between the upstream confirm and the local settle; this watcher asks
/// the processor what actually happened and converges the ledger.
pub struct SettlementWatcher {
    pipeline: SettlementPipeline,
    sync_interval: Duration,
    stuck_after: time::Duration,
    sweep_concurrency: usize,
    cancel_token: CancellationToken,
}

impl SettlementWatcher {
    pub fn new(
        pipeline: SettlementPipeline,
        cancel_token: CancellationToken,
        sync_interval: Duration,
        stuck_after: time::Duration,
        sweep_concurrency: usize,
    ) -> Self {
        Self {
            pipeline,
            sync_interval,
            stuck_after,
            sweep_concurrency: sweep_concurrency.max(1),
            cancel_token,
        }
    }

    pub async fn watch(&self) -> Result<(), anyhow::Error> {
        info!("Starting settlement watcher");

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Settlement watcher received cancellation");
                break;
            }

            match self.sweep_stuck_payments().await {
                Ok(_) => {
                    debug!("Settlement sweep completed");
                }
                Err(e) => {
                    error!("Settlement sweep error: {}", e);
                }
            }

            tokio::select! {
                _ = sleep(self.sync_interval) => continue,
                _ = self.cancel_token.cancelled() => {
                    info!("Settlement watcher cancelled during sleep");
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn sweep_stuck_payments(&self) -> Result<(), anyhow::Error> {
        let stuck = self
            .pipeline
            .payments()
            .get_stuck_approved(self.stuck_after)
            .await?;

        if stuck.is_empty() {
            return Ok(());
        }
        debug!("Reconciling {} stuck payments", stuck.len());

        stream::iter(stuck)
            .for_each_concurrent(self.sweep_concurrency, |payment| {
                let pipeline = self.pipeline.clone();
                async move {
                    if let Err(e) = pipeline.reconcile(&payment.payment_id).await {
                        warn!(
                            "Failed to reconcile stuck payment {}: {}",
                            payment.payment_id, e
                        );
                    }
                }
            })
            .await;

        Ok(())
    }
}
