//! Background maintenance tasks.
//!
//! Two periodic loops keep the aggregator honest without ever touching the
//! decision hot path:
//! 1. Flush — batches dirty connection counters to SQLite. Failures are
//!    logged and retried next tick; they never block `record()`.
//! 2. Prune — deletes records past the retention window.

use std::sync::Arc;

use crate::aggregator::ConnectionAggregator;
use crate::config::CoreConfig;

/// Owns the background task handles; tasks are aborted on shutdown or drop.
pub struct BackgroundTasks {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn the flush and prune loops on the current tokio runtime.
    pub fn start(aggregator: Arc<ConnectionAggregator>, config: &CoreConfig) -> Self {
        let mut handles = Vec::new();

        let agg = Arc::clone(&aggregator);
        let flush_interval = config.flush_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match agg.flush() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Flushed {n} connection records"),
                    Err(e) => tracing::warn!("Connection flush failed: {e:#}"),
                }
            }
        }));

        let agg = aggregator;
        let prune_interval = config.prune_interval;
        let retention = config.retention;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prune_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; skip the startup tick so pruning
            // stays strictly periodic.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = agg.prune(retention) {
                    tracing::warn!("Connection prune failed: {e:#}");
                }
            }
        }));

        tracing::info!("Background tasks started (flush + prune)");
        Self { handles }
    }

    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}
