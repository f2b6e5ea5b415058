//! Historical utilization snapshots
//!
//! An append-only, TTL-pruned time series keyed on (cluster, 10 s bucket).
//! It seeds the dashboard with the trailing day of history on connect and
//! backs the secondary, percentile-based prediction path. The DynamoDB
//! implementation lives in [`dynamo`]; tests use the in-memory store from
//! `crate::testing`.

pub mod dynamo;

pub use dynamo::DynamoSnapshotStore;

use crate::error::Result;
use crate::types::{truncate_to_bucket, UtilizationSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Fraction of the window's snapshots a percentile lookup skips past
const PERCENTILE: f64 = 0.98;

/// Span of the history seed sent to a freshly connected client
pub fn seed_window() -> ChronoDuration {
    ChronoDuration::hours(24)
}

/// Time-series store for utilization snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upsert one snapshot; overwrites any entry in the same bucket
    async fn put(&self, snapshot: &UtilizationSnapshot) -> Result<()>;

    /// All snapshots for the cluster within [start, end], oldest first
    async fn range_by_cluster(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UtilizationSnapshot>>;

    /// The trailing day of history, used to seed the dashboard
    async fn seed_history(
        &self,
        cluster: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UtilizationSnapshot>> {
        self.range_by_cluster(cluster, truncate_to_bucket(now - seed_window()), now)
            .await
    }

    /// Last week's snapshots shifted into the near future: entries from
    /// `(now - 7d) + window` onward, re-timestamped forward one week minus
    /// the window and flagged as future values. Seeds the prediction graph.
    async fn prediction_snapshots(
        &self,
        cluster: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<UtilizationSnapshot>> {
        let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero());
        let start = truncate_to_bucket(now - ChronoDuration::days(7) + window);
        let end = truncate_to_bucket(start + window * 10);

        let mut snapshots = self.range_by_cluster(cluster, start, end).await?;
        for snapshot in &mut snapshots {
            snapshot.timestamp =
                truncate_to_bucket(snapshot.timestamp + ChronoDuration::days(7) - window);
            snapshot.future_value = true;
        }
        Ok(snapshots)
    }

    /// The snapshot at the 98th utilization percentile within
    /// `[lookup, lookup + window]`, or `None` when the window is empty
    async fn percentile_at(
        &self,
        cluster: &str,
        lookup: DateTime<Utc>,
        window: Duration,
    ) -> Result<Option<UtilizationSnapshot>> {
        let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero());
        let mut snapshots = self.range_by_cluster(cluster, lookup, lookup + window).await?;
        if snapshots.is_empty() {
            return Ok(None);
        }

        snapshots.sort_by(|a, b| {
            a.max_cpu_utilization
                .partial_cmp(&b.max_cpu_utilization)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let index = ((snapshots.len() as f64 * PERCENTILE).ceil() as usize)
            .clamp(1, snapshots.len())
            - 1;
        Ok(Some(snapshots.swap_remove(index)))
    }
}
