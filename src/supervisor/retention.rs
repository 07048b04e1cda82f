//! Periodic hot/warm/cold event retention sweep.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::store::{ControlStore, RetentionReport, StoreError};

pub fn spawn_retention_sweep(
    store: Arc<dyn ControlStore>,
    config: RetentionConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            hot_hours = config.hot.num_hours(),
            warm_hours = config.warm.num_hours(),
            "Retention sweep started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep(store.as_ref(), &config).await {
                        Ok(report) if report != RetentionReport::default() => {
                            tracing::info!(
                                artifacts_dropped = report.artifacts_dropped,
                                events_deleted = report.events_deleted,
                                "Retention sweep applied"
                            );
                        }
                        Ok(_) => tracing::debug!("Retention sweep: nothing to do"),
                        Err(err) => tracing::warn!(error = %err, "Retention sweep failed"),
                    }
                }
            }
        }
    })
}

async fn sweep(
    store: &dyn ControlStore,
    config: &RetentionConfig,
) -> Result<RetentionReport, StoreError> {
    let now = Utc::now();
    store
        .apply_retention(now - config.hot, now - config.warm)
        .await
}
