//! Shared wire and persistence types
//!
//! Everything that crosses the WebSocket or lands in the snapshot store is
//! defined here. Field names are part of the wire contract with the dashboard
//! and must stay stable.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Width of a snapshot bucket; timestamps are truncated to this grid
pub const SNAPSHOT_BUCKET_SECS: i64 = 10;

/// How long persisted snapshots live before TTL expiry
pub const SNAPSHOT_TTL_DAYS: i64 = 8;

/// Server-to-client broadcast message kinds
pub mod kind {
    pub const CONFIG: &str = "config";
    pub const CLUSTER_STATUS: &str = "clusterStatus";
    pub const CLUSTER_STATUS_PREDICTION: &str = "clusterStatusPrediction";
    pub const CLUSTER_STATUS_HISTORY: &str = "clusterStatusHistory";
    pub const CLUSTER_STATUS_PREDICTION_HISTORY: &str = "clusterStatusPredictionHistory";
    pub const SCALE_OUT_STATUS: &str = "scaleOutStatus";
    pub const SCALE_IN_STATUS: &str = "scaleInStatus";
    pub const PREDICTION: &str = "prediction";
    pub const SNAPSHOT: &str = "snapshot";
    /// Client-to-server live configuration patch
    pub const CONF_UPDATE: &str = "conf_update";
}

/// Per-instance view assembled from the cloud describe call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub identifier: String,
    pub is_writer: bool,
    pub status: String,
    pub cpu_utilization: f64,
}

/// Per-tick snapshot of the cluster, current or historic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub average_cpu_utilization: f64,
    /// Writer plus every reader whose status is `available`; always >= 1
    pub current_active_readers: u32,
    pub optimal_size: u32,
    #[serde(rename = "instance_status", default)]
    pub instances: Vec<InstanceStatus>,
}

/// A time-bucketed utilization record persisted to the snapshot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cluster_name: String,
    pub num_readers: u32,
    pub max_cpu_utilization: f64,
    /// True when the historic estimate drove the recorded value
    pub predicted_value: bool,
    /// True for seed entries re-timestamped into the future
    #[serde(default)]
    pub future_value: bool,
    /// Unix seconds after which the store may drop the entry
    pub ttl: i64,
}

impl UtilizationSnapshot {
    /// Build a snapshot bucketed at `now` with the standard TTL
    pub fn new(
        cluster_name: &str,
        now: DateTime<Utc>,
        num_readers: u32,
        max_cpu_utilization: f64,
        predicted_value: bool,
    ) -> Self {
        let timestamp = truncate_to_bucket(now);
        Self {
            timestamp,
            cluster_name: cluster_name.to_string(),
            num_readers,
            max_cpu_utilization,
            predicted_value,
            future_value: false,
            ttl: (timestamp + ChronoDuration::days(SNAPSHOT_TTL_DAYS)).timestamp(),
        }
    }
}

/// Truncate a timestamp down to the snapshot bucket grid
pub fn truncate_to_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(ChronoDuration::seconds(SNAPSHOT_BUCKET_SECS))
        .unwrap_or(ts)
}

/// Tagged JSON envelope fanned out to dashboard clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Broadcast {
    /// Wrap a serializable payload under the given message kind
    pub fn new<T: Serialize>(kind: &str, data: &T) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            tracing::error!(kind = %kind, error = %e, "Failed to serialize broadcast payload");
            serde_json::Value::Null
        });
        Self {
            kind: kind.to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_bucket() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 47).unwrap();
        let truncated = truncate_to_bucket(ts);
        assert_eq!(truncated.timestamp() % SNAPSHOT_BUCKET_SECS, 0);
        assert_eq!(
            truncated,
            Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 40).unwrap()
        );
    }

    #[test]
    fn test_snapshot_bucketing_and_ttl() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 47).unwrap();
        let snapshot = UtilizationSnapshot::new("demo-cluster", now, 3, 42.5, false);

        assert_eq!(snapshot.timestamp.timestamp() % SNAPSHOT_BUCKET_SECS, 0);
        assert!(snapshot.ttl > (snapshot.timestamp + ChronoDuration::days(7)).timestamp());
        assert_eq!(snapshot.cluster_name, "demo-cluster");
        assert!(!snapshot.future_value);
    }

    #[test]
    fn test_broadcast_envelope_shape() {
        let status = InstanceStatus {
            identifier: "reader-1".to_string(),
            is_writer: false,
            status: "available".to_string(),
            cpu_utilization: 55.0,
        };
        let broadcast = Broadcast::new(kind::CLUSTER_STATUS, &status);
        let json = serde_json::to_string(&broadcast).unwrap();
        assert!(json.contains("\"type\":\"clusterStatus\""));
        assert!(json.contains("\"identifier\":\"reader-1\""));
    }

    #[test]
    fn test_cluster_status_serde_field_names() {
        let status = ClusterStatus {
            identifier: "demo".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            average_cpu_utilization: 50.0,
            current_active_readers: 2,
            optimal_size: 3,
            instances: Vec::new(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"average_cpu_utilization\""));
        assert!(json.contains("\"current_active_readers\""));
        assert!(json.contains("\"optimal_size\""));
        assert!(json.contains("\"instance_status\""));
    }
}
