//! Cloud provider abstraction
//!
//! The scaler only ever talks to the cluster through [`CloudProvider`]; the
//! AWS implementation lives in [`aws`], and the in-memory fake used by tests
//! lives in `crate::testing`. Reads are idempotent; create/delete are
//! eventually consistent and observed through polling.

pub mod aws;

pub use aws::AwsCloudProvider;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a database instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Available,
    BackingUp,
    ConfiguringEnhancedMonitoring,
    Creating,
    Deleting,
    Failed,
    Maintenance,
    Modifying,
    Rebooting,
    Renaming,
    Starting,
    Stopped,
    Stopping,
    Upgrading,
    Other(String),
}

impl InstanceState {
    /// Parse the provider's wire string
    pub fn parse(value: &str) -> Self {
        match value {
            "available" => InstanceState::Available,
            "backing-up" => InstanceState::BackingUp,
            "configuring-enhanced-monitoring" => InstanceState::ConfiguringEnhancedMonitoring,
            "creating" => InstanceState::Creating,
            "deleting" => InstanceState::Deleting,
            "failed" => InstanceState::Failed,
            "maintenance" => InstanceState::Maintenance,
            "modifying" => InstanceState::Modifying,
            "rebooting" => InstanceState::Rebooting,
            "renaming" => InstanceState::Renaming,
            "starting" => InstanceState::Starting,
            "stopped" => InstanceState::Stopped,
            "stopping" => InstanceState::Stopping,
            "upgrading" => InstanceState::Upgrading,
            other => InstanceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Available => "available",
            InstanceState::BackingUp => "backing-up",
            InstanceState::ConfiguringEnhancedMonitoring => "configuring-enhanced-monitoring",
            InstanceState::Creating => "creating",
            InstanceState::Deleting => "deleting",
            InstanceState::Failed => "failed",
            InstanceState::Maintenance => "maintenance",
            InstanceState::Modifying => "modifying",
            InstanceState::Rebooting => "rebooting",
            InstanceState::Renaming => "renaming",
            InstanceState::Starting => "starting",
            InstanceState::Stopped => "stopped",
            InstanceState::Stopping => "stopping",
            InstanceState::Upgrading => "upgrading",
            InstanceState::Other(s) => s,
        }
    }

    /// Only `available` instances serve traffic and report metrics
    pub fn is_available(&self) -> bool {
        matches!(self, InstanceState::Available)
    }

    /// An instance can be deleted unless it is mid-transition
    pub fn is_deletable(&self) -> bool {
        !matches!(
            self,
            InstanceState::Deleting
                | InstanceState::Modifying
                | InstanceState::Maintenance
                | InstanceState::Rebooting
        )
    }

    /// States a freshly created replica passes through before `available`
    pub fn is_starting_up(&self) -> bool {
        matches!(
            self,
            InstanceState::Creating | InstanceState::ConfiguringEnhancedMonitoring
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects which reader instances a describe call returns
#[derive(Debug, Clone)]
pub enum StatusFilter {
    /// Every reader regardless of state
    Any,
    /// Readers whose state satisfies the predicate name
    Excluding(Vec<InstanceState>),
    /// Only readers in one of the listed states
    Only(Vec<InstanceState>),
}

impl StatusFilter {
    pub fn matches(&self, state: &InstanceState) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Excluding(states) => !states.contains(state),
            StatusFilter::Only(states) => states.contains(state),
        }
    }

    /// Everything that is not already going away
    pub fn excluding_deleting() -> Self {
        StatusFilter::Excluding(vec![InstanceState::Deleting])
    }

    /// Replicas still on their way to `available`
    pub fn starting_up() -> Self {
        StatusFilter::Only(vec![
            InstanceState::Creating,
            InstanceState::ConfiguringEnhancedMonitoring,
        ])
    }
}

/// A cluster member as described by the provider; the writer's copy of this
/// is used as the template for new replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbInstance {
    pub identifier: String,
    pub is_writer: bool,
    pub state: InstanceState,
    pub instance_class: Option<String>,
    pub engine: Option<String>,
    pub multi_az: Option<bool>,
    pub copy_tags_to_snapshot: Option<bool>,
    pub auto_minor_version_upgrade: Option<bool>,
    pub parameter_group: Option<String>,
    pub ca_certificate_identifier: Option<String>,
}

/// One point of the cluster-level CPU aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct CpuSample {
    pub timestamp: DateTime<Utc>,
    pub average_cpu: f64,
    /// Number of per-instance datapoints folded into the average; proxies
    /// the instance count since each instance emits one sample per minute
    pub sample_count: f64,
}

/// The cluster operations the scaler core needs
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The single read-write instance of the cluster
    async fn writer_instance(&self) -> Result<DbInstance>;

    /// All non-writer members matching the filter
    async fn reader_instances(&self, filter: StatusFilter) -> Result<Vec<DbInstance>>;

    /// Average CPU of one instance over the trailing window
    async fn instance_cpu_average(&self, identifier: &str, window: Duration) -> Result<f64>;

    /// Cluster-level CPU average + sample count over [start, end) at the
    /// given period, scanned oldest first
    async fn cluster_cpu_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Duration,
    ) -> Result<Vec<CpuSample>>;

    /// Create a reader cloned from the writer template
    async fn create_reader(&self, identifier: &str, template: &DbInstance) -> Result<()>;

    /// Delete a reader, skipping the final snapshot
    async fn delete_reader(&self, identifier: &str) -> Result<()>;

    /// Current state of one instance, or `None` once it is gone
    async fn instance_state(&self, identifier: &str) -> Result<Option<InstanceState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse_round_trip() {
        for raw in [
            "available",
            "creating",
            "deleting",
            "modifying",
            "backing-up",
            "configuring-enhanced-monitoring",
            "maintenance",
            "rebooting",
        ] {
            assert_eq!(InstanceState::parse(raw).as_str(), raw);
        }
        assert_eq!(
            InstanceState::parse("incompatible-network"),
            InstanceState::Other("incompatible-network".to_string())
        );
    }

    #[test]
    fn test_deletable_states() {
        assert!(InstanceState::Available.is_deletable());
        assert!(InstanceState::BackingUp.is_deletable());
        assert!(InstanceState::Creating.is_deletable());
        assert!(!InstanceState::Deleting.is_deletable());
        assert!(!InstanceState::Modifying.is_deletable());
        assert!(!InstanceState::Maintenance.is_deletable());
        assert!(!InstanceState::Rebooting.is_deletable());
    }

    #[test]
    fn test_status_filters() {
        let excluding = StatusFilter::excluding_deleting();
        assert!(excluding.matches(&InstanceState::Available));
        assert!(excluding.matches(&InstanceState::Creating));
        assert!(!excluding.matches(&InstanceState::Deleting));

        let starting = StatusFilter::starting_up();
        assert!(starting.matches(&InstanceState::Creating));
        assert!(starting.matches(&InstanceState::ConfiguringEnhancedMonitoring));
        assert!(!starting.matches(&InstanceState::Available));

        assert!(StatusFilter::Any.matches(&InstanceState::Failed));
    }
}
