//! Cluster metrics engine
//!
//! Translates raw cloud metrics into [`ClusterStatus`] values, both for the
//! live cluster and for a historical window one week back. The engine holds
//! no state of its own; it is pure computation over provider responses.

use crate::cloud::{CloudProvider, CpuSample, StatusFilter};
use crate::config::SharedConfig;
use crate::error::{Result, ScalerError};
use crate::types::ClusterStatus;
use crate::types::InstanceStatus;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Window for per-instance CPU averaging (one CloudWatch period)
pub const INSTANCE_CPU_WINDOW: Duration = Duration::from_secs(300);

/// Offset of the historical reference window
pub fn history_offset() -> ChronoDuration {
    ChronoDuration::days(7)
}

/// A source of near-future cluster predictions
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Expected cluster status `look_ahead` from now
    async fn predict(&self, look_ahead: Duration) -> Result<ClusterStatus>;
}

/// Builds current and historic cluster status values from provider metrics
pub struct MetricsEngine {
    provider: Arc<dyn CloudProvider>,
    config: SharedConfig,
}

impl MetricsEngine {
    pub fn new(provider: Arc<dyn CloudProvider>, config: SharedConfig) -> Self {
        Self { provider, config }
    }

    /// Assemble the live snapshot: every cluster member, CPU for the
    /// available ones, average over the active population, and the optimal
    /// size the current load calls for.
    ///
    /// A failing describe call fails the whole snapshot; a failing
    /// per-instance metric query degrades that instance to cpu=0.
    pub async fn current_cluster_status(&self) -> Result<ClusterStatus> {
        let config = self.config.get();

        let writer = self
            .provider
            .writer_instance()
            .await
            .map_err(|e| ScalerError::MetricsUnavailable(e.to_string()))?;
        let readers = self
            .provider
            .reader_instances(StatusFilter::Any)
            .await
            .map_err(|e| ScalerError::MetricsUnavailable(e.to_string()))?;

        let mut instances = Vec::with_capacity(readers.len() + 1);
        for member in std::iter::once(&writer).chain(readers.iter()) {
            let cpu_utilization = if member.state.is_available() {
                match self
                    .provider
                    .instance_cpu_average(&member.identifier, INSTANCE_CPU_WINDOW)
                    .await
                {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            instance = %member.identifier,
                            error = %e,
                            "CPU metric unavailable, counting instance as idle"
                        );
                        0.0
                    }
                }
            } else {
                0.0
            };

            instances.push(InstanceStatus {
                identifier: member.identifier.clone(),
                is_writer: member.is_writer,
                status: member.state.to_string(),
                cpu_utilization,
            });
        }

        let active: Vec<&InstanceStatus> = instances
            .iter()
            .filter(|i| i.status == "available")
            .collect();
        // the writer always serves, so the active population is never empty
        let current_active_readers = (active.len() as u32).max(1);
        let average_cpu_utilization = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|i| i.cpu_utilization).sum::<f64>() / active.len() as f64
        };

        Ok(ClusterStatus {
            identifier: config.cluster_identifier.clone(),
            timestamp: Utc::now(),
            average_cpu_utilization,
            current_active_readers,
            optimal_size: optimal_size(
                average_cpu_utilization,
                current_active_readers,
                config.min_instances,
                config.max_instances,
                config.target_cpu_util,
            ),
            instances,
        })
    }

    /// Status of the cluster one week ago, shifted forward by `look_ahead`:
    /// a single `look_ahead`-wide window ending at `(now - 7d) + look_ahead`
    pub async fn historic_cluster_status(&self, look_ahead: Duration) -> Result<ClusterStatus> {
        let start = Utc::now() - history_offset();
        let window = ChronoDuration::from_std(look_ahead)
            .map_err(|e| ScalerError::MetricsUnavailable(e.to_string()))?;

        let mut history = self
            .cluster_status_range(start, start + window, look_ahead)
            .await?;

        if history.is_empty() {
            return Err(ScalerError::NoHistoricData);
        }
        Ok(history.remove(0))
    }

    /// Cluster status over [start, end), one entry per `step`; used for the
    /// dashboard back-fill
    pub async fn cluster_status_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<ClusterStatus>> {
        let config = self.config.get();
        // metric periods must be a whole number of minutes
        let period = Duration::from_secs((step.as_secs() / 60).max(1) * 60);

        let samples = self
            .provider
            .cluster_cpu_history(start, end, period)
            .await?;

        Ok(samples
            .iter()
            .map(|sample| self.status_from_sample(&config, sample, period))
            .collect())
    }

    fn status_from_sample(
        &self,
        config: &crate::config::Config,
        sample: &CpuSample,
        period: Duration,
    ) -> ClusterStatus {
        // each instance emits one datapoint per minute, so the sample count
        // over the period recovers the instance count
        let readers = (sample.sample_count / period.as_secs_f64() * 60.0).ceil() as u32;
        ClusterStatus {
            identifier: config.cluster_identifier.clone(),
            timestamp: sample.timestamp,
            average_cpu_utilization: sample.average_cpu,
            current_active_readers: readers,
            optimal_size: optimal_size(
                sample.average_cpu,
                readers,
                config.min_instances,
                config.max_instances,
                config.target_cpu_util,
            ),
            instances: Vec::new(),
        }
    }
}

#[async_trait]
impl Predictor for MetricsEngine {
    async fn predict(&self, look_ahead: Duration) -> Result<ClusterStatus> {
        self.historic_cluster_status(look_ahead).await
    }
}

/// Number of instances needed to spread the observed load at the target
/// utilization, clamped to the configured bounds. Assumes CPU shards
/// linearly across replicas of identical class; the active count includes
/// the writer because the writer also serves reads.
pub fn optimal_size(cpu: f64, active_count: u32, min: u32, max: u32, target: f64) -> u32 {
    let needed = (cpu * active_count as f64 / target).ceil() as u32;
    needed.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InstanceState;
    use crate::config::{Config, ConfigCell};
    use crate::testing::TestCluster;
    use std::collections::BTreeSet;

    fn engine_with(cluster: Arc<TestCluster>) -> MetricsEngine {
        let config = ConfigCell::new(Config {
            cluster_identifier: "demo-cluster".to_string(),
            region: "eu-west-1".to_string(),
            instance_name_prefix: "predictive-autoscaling-".to_string(),
            min_instances: 2,
            max_instances: 5,
            target_cpu_util: 70.0,
            boost_hours: BTreeSet::new(),
            plan_ahead_time: Duration::from_secs(600),
            server_port: 8041,
        });
        MetricsEngine::new(cluster, config)
    }

    #[tokio::test]
    async fn test_current_status_averages_active_instances_only() {
        let cluster = Arc::new(TestCluster::with_writer(60.0));
        cluster.add_reader("reader-1", InstanceState::Available, 30.0);
        cluster.add_reader("reader-2", InstanceState::Creating, 0.0);
        let engine = engine_with(cluster);

        let status = engine.current_cluster_status().await.unwrap();
        // the creating reader is listed but excluded from the average
        assert_eq!(status.instances.len(), 3);
        assert_eq!(status.current_active_readers, 2);
        assert!((status.average_cpu_utilization - 45.0).abs() < 1e-9);

        // emitted average always equals the mean over available instances
        let available: Vec<f64> = status
            .instances
            .iter()
            .filter(|i| i.status == "available")
            .map(|i| i.cpu_utilization)
            .collect();
        let mean = available.iter().sum::<f64>() / available.len() as f64;
        assert!((status.average_cpu_utilization - mean).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_current_status_optimal_size_within_bounds() {
        let cluster = Arc::new(TestCluster::with_writer(99.0));
        for i in 0..4 {
            cluster.add_reader(&format!("reader-{i}"), InstanceState::Available, 99.0);
        }
        let engine = engine_with(cluster);

        let status = engine.current_cluster_status().await.unwrap();
        assert!(status.optimal_size >= 2);
        assert!(status.optimal_size <= 5);
    }

    #[tokio::test]
    async fn test_current_status_fails_when_describe_fails() {
        let cluster = Arc::new(TestCluster::with_writer(10.0));
        cluster.set_fail_describe(true);
        let engine = engine_with(cluster);

        assert!(matches!(
            engine.current_cluster_status().await,
            Err(ScalerError::MetricsUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_historic_status_derives_reader_count_from_samples() {
        let cluster = Arc::new(TestCluster::with_writer(0.0));
        // 30 one-minute samples over a 600 s period decode to 3 instances
        cluster.set_history(vec![CpuSample {
            timestamp: Utc::now() - ChronoDuration::days(7),
            average_cpu: 84.0,
            sample_count: 30.0,
        }]);
        let engine = engine_with(cluster);

        let status = engine
            .historic_cluster_status(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(status.current_active_readers, 3);
        // ceil(84 * 3 / 70) = 4
        assert_eq!(status.optimal_size, 4);
    }

    #[tokio::test]
    async fn test_historic_status_empty_is_no_historic_data() {
        let cluster = Arc::new(TestCluster::with_writer(0.0));
        let engine = engine_with(cluster);

        assert!(matches!(
            engine.historic_cluster_status(Duration::from_secs(600)).await,
            Err(ScalerError::NoHistoricData)
        ));
    }

    #[tokio::test]
    async fn test_range_rounds_period_down_to_minutes() {
        let cluster = Arc::new(TestCluster::with_writer(0.0));
        let engine = engine_with(cluster.clone());
        let start = Utc::now() - ChronoDuration::days(7);

        engine
            .cluster_status_range(
                start,
                start + ChronoDuration::seconds(630),
                Duration::from_secs(630),
            )
            .await
            .unwrap();
        let (_, _, period) = cluster.last_history_query().unwrap();
        assert_eq!(period, Duration::from_secs(600));
    }

    #[test]
    fn test_optimal_size_at_target_is_stable() {
        // at exactly the target, neither direction triggers
        for active in 1..=5 {
            assert_eq!(optimal_size(70.0, active, 1, 10, 70.0), active);
        }
    }

    #[test]
    fn test_optimal_size_scales_with_load() {
        // 85% on 2 instances at a 70% target needs a third
        assert_eq!(optimal_size(85.0, 2, 2, 5, 70.0), 3);
        // 20% on 4 instances collapses to the minimum
        assert_eq!(optimal_size(20.0, 4, 2, 5, 70.0), 2);
    }

    #[test]
    fn test_optimal_size_clamps() {
        assert_eq!(optimal_size(100.0, 8, 2, 5, 10.0), 5);
        assert_eq!(optimal_size(0.0, 1, 2, 5, 70.0), 2);
    }

    #[test]
    fn test_optimal_size_idle_single_node() {
        assert_eq!(optimal_size(5.0, 1, 1, 5, 70.0), 1);
    }
}
