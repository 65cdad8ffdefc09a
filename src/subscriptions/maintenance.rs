use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config;

use super::store::SubscriptionStore;

const RATE_WINDOW_MINUTES: i64 = 60;

/// key: usage-maintenance -> advisory pruning of the sliding-window log
///
/// Quota correctness never depends on this worker: the rate limit recounts
/// the trailing window and the token budget resets lazily. This only keeps
/// the request log from growing unbounded.
pub fn spawn(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>) {
    let interval = TokioDuration::from_secs(*config::USAGE_MAINTENANCE_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(store.as_ref(), clock.as_ref()).await {
                warn!(?err, "usage maintenance tick failed");
            }
        }
    });
}

pub async fn process_tick(store: &dyn SubscriptionStore, clock: &dyn Clock) -> Result<()> {
    let cutoff = clock.now() - Duration::minutes(RATE_WINDOW_MINUTES);
    let pruned = store.prune_requests(cutoff).await?;
    if pruned > 0 {
        debug!(pruned, "pruned expired rate-window entries");
    }
    Ok(())
}
