//! Retention: timer records older than 90 days are deleted on a fixed interval.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::store::{Persistence, StoreResult};

pub const RETENTION_DAYS: i64 = 90;
pub const PURGE_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);

/// Records that started before this instant are past the retention horizon.
pub fn retention_threshold(now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::days(RETENTION_DAYS)
}

/// Deletes expired records, returning how many were removed.
pub async fn purge_expired(
    persistence: &dyn Persistence,
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    let threshold = retention_threshold(now);
    let removed = persistence.delete_timer_records_before(threshold).await?;
    if removed > 0 {
        info!("Purged {} timer records started before {}", removed, threshold);
    } else {
        debug!("No timer records past retention");
    }
    Ok(removed)
}

/// Runs a purge immediately and then every `period` until `shutdown` flips.
/// Failures are logged and retried on the next tick.
pub async fn run_purger(
    persistence: Arc<dyn Persistence>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = purge_expired(persistence.as_ref(), Utc::now()).await {
                    warn!("Retention purge failed: {}", err);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Retention purger stopping");
                    break;
                }
            }
        }
    }
}
