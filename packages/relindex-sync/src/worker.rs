//! Background bulk queue drain

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::indexer::{BulkOutcome, RecordIndexer};

/// Periodically drains one indexer's bulk queue
///
/// Run exactly one worker per queue.
pub struct BulkIndexWorker {
    indexer: Arc<RecordIndexer>,
    interval: Duration,
}

impl BulkIndexWorker {
    pub fn new(indexer: Arc<RecordIndexer>, interval: Duration) -> Self {
        Self { indexer, interval }
    }

    pub fn from_config(indexer: Arc<RecordIndexer>, config: &WorkerConfig) -> Self {
        Self::new(indexer, Duration::from_millis(config.interval_ms))
    }

    /// Drain once
    pub async fn run_once(&self) -> Result<BulkOutcome> {
        self.indexer.process_bulk_queue().await
    }

    /// Drain on every tick until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.interval.as_millis() as u64, "Bulk index worker started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Bulk index worker stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Bulk queue drain failed");
                        }
                    }
                }
            }
        })
    }
}
