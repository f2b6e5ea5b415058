//! Predictive horizontal autoscaler for Aurora-style database clusters
//!
//! One writer, a scaled population of read replicas, and a 10-second control
//! loop that decides how many readers the cluster should carry. The decision
//! blends two estimates and takes the larger:
//!
//! - the size the **current** CPU load calls for, and
//! - the size **last week's** load called for at `now + PlanAheadTime`,
//!   so capacity is provisioned before a recurring spike arrives.
//!
//! `PlanAheadTime` is self-adjusting: every scale-out measures how long
//! provisioning actually took and raises the look-ahead (plus a safety
//! margin) so the prediction always looks at least as far ahead as the
//! cluster needs to grow. It never decreases.
//!
//! ## Components
//!
//! - [`cloud`] — the provider seam and its AWS (RDS + CloudWatch) adapter
//! - [`metrics`] — turns raw metrics into [`types::ClusterStatus`] values
//! - [`scaler`] — the controller tick loop and the scaling executor
//! - [`history`] — the TTL-pruned snapshot time series (DynamoDB)
//! - [`server`] — broadcast bus, WebSocket fan-out, dashboard HTTP surface
//! - [`config`] — CLI flags, validation, live-updatable settings
//!
//! Scaling is single-flight: at most one operation is in motion at any
//! instant, guarded by the runtime state's `is_scaling` flag.

pub mod cloud;
pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod scaler;
pub mod server;
pub mod testing;
pub mod types;

pub use cloud::{AwsCloudProvider, CloudProvider};
pub use config::{CliArgs, Config, ConfigCell, SharedConfig};
pub use error::{Result, ScalerError};
pub use history::{DynamoSnapshotStore, SnapshotStore};
pub use metrics::{MetricsEngine, Predictor};
pub use scaler::{RuntimeState, Scaler, ScalingExecutor};
pub use server::{AppState, BroadcastBus};
pub use types::{Broadcast, ClusterStatus, InstanceStatus, UtilizationSnapshot};
