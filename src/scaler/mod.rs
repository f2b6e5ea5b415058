//! Predictive scaling controller
//!
//! A fixed 10-second tick: sample the cluster, look up the same moment one
//! week back shifted by the plan-ahead window, take the larger of the two
//! size estimates, and hand any difference to the executor. Every tick emits
//! one `clusterStatus` and one `clusterStatusPrediction` broadcast and
//! persists one utilization snapshot.
//!
//! The tick loop never propagates errors; each failure is logged and the
//! next tick starts from scratch.

pub mod executor;
pub mod state;

pub use executor::ScalingExecutor;
pub use state::{PlanAhead, RuntimeState};

use crate::config::SharedConfig;
use crate::error::{Result, ScalerError};
use crate::history::SnapshotStore;
use crate::metrics::{MetricsEngine, Predictor};
use crate::server::broadcast::BroadcastBus;
use crate::types::{kind, Broadcast, ClusterStatus, UtilizationSnapshot};
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Controller tick period
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// The scaling controller; owns the runtime state and drives the executor
pub struct Scaler {
    config: SharedConfig,
    state: Arc<RuntimeState>,
    engine: Arc<MetricsEngine>,
    /// Prediction source; the metrics engine's historical query by default,
    /// but any implementation of the seam plugs in here
    predictor: Arc<dyn Predictor>,
    executor: Arc<ScalingExecutor>,
    store: Arc<dyn SnapshotStore>,
    bus: BroadcastBus,
}

impl Scaler {
    pub fn new(
        config: SharedConfig,
        state: Arc<RuntimeState>,
        engine: Arc<MetricsEngine>,
        predictor: Arc<dyn Predictor>,
        executor: Arc<ScalingExecutor>,
        store: Arc<dyn SnapshotStore>,
        bus: BroadcastBus,
    ) -> Self {
        Self {
            config,
            state,
            engine,
            predictor,
            executor,
            store,
            bus,
        }
    }

    pub fn runtime_state(&self) -> Arc<RuntimeState> {
        Arc::clone(&self.state)
    }

    /// Run the tick loop until the shutdown signal flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = TICK_INTERVAL.as_secs(),
            "Scaling controller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_benign() {
                            info!(outcome = %e, "Tick ended without action");
                        } else {
                            error!(error = %e, "Tick failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Scaling controller stopping");
                    break;
                }
            }
        }
    }

    /// One pass of the control loop
    pub async fn tick(&self) -> Result<()> {
        let config = self.config.get();

        let current = self.engine.current_cluster_status().await?;
        self.bus
            .publish(Broadcast::new(kind::CLUSTER_STATUS, &current));

        let plan_ahead = self.state.plan_ahead.get();
        let historic = match self.predictor.predict(plan_ahead).await {
            Ok(status) => Some(status),
            Err(ScalerError::NoHistoricData) => {
                debug!("No historic data, sizing on current load only");
                None
            }
            Err(e) => return Err(e),
        };
        // every tick carries exactly one prediction message; without history
        // it is an empty estimate the dashboard renders as "no prediction"
        let prediction = historic.clone().unwrap_or_else(|| ClusterStatus {
            identifier: config.cluster_identifier.clone(),
            timestamp: Utc::now(),
            average_cpu_utilization: 0.0,
            current_active_readers: 0,
            optimal_size: 0,
            instances: Vec::new(),
        });
        self.bus
            .publish(Broadcast::new(kind::CLUSTER_STATUS_PREDICTION, &prediction));
        let historic_optimal = historic.as_ref().map(|s| s.optimal_size).unwrap_or(0);

        self.persist_snapshot(&config.cluster_identifier, &current, historic.as_ref(), plan_ahead)
            .await;

        let utc_hour = Utc::now().hour() as u8;
        let effective_min = if config.is_boost_hour(utc_hour) {
            (config.min_instances + 1).min(config.max_instances)
        } else {
            config.min_instances
        };

        let desired = current
            .optimal_size
            .max(historic_optimal)
            .max(effective_min)
            .clamp(effective_min, config.max_instances);

        info!(
            cpu = %format!("{:.2}", current.average_cpu_utilization),
            active = current.current_active_readers,
            optimal = current.optimal_size,
            predicted_optimal = historic_optimal,
            effective_min = effective_min,
            desired = desired,
            plan_ahead_secs = plan_ahead.as_secs(),
            "Scaler status"
        );

        if desired == current.current_active_readers {
            info!("Cluster at optimal size");
            return Ok(());
        }
        if self.state.is_scaling() {
            // single-flight: never queue a second operation
            return Err(ScalerError::ScalingBusy);
        }

        if desired > current.current_active_readers {
            let add = desired - current.current_active_readers;
            info!(add = add, "Scaling out");
            let _ = self.executor.begin_scale_out(add)?;
        } else {
            let remove = current.current_active_readers - desired;
            info!(remove = remove, "Scaling in");
            let _ = self.executor.begin_scale_in(remove)?;
        }
        Ok(())
    }

    /// Persist one bucketed snapshot and emit the snapshot/prediction
    /// telemetry. Persistence failures never abort the tick.
    async fn persist_snapshot(
        &self,
        cluster: &str,
        current: &ClusterStatus,
        historic: Option<&ClusterStatus>,
        plan_ahead: Duration,
    ) {
        let predicted = historic
            .map(|h| h.optimal_size > current.optimal_size)
            .unwrap_or(false);
        let snapshot = UtilizationSnapshot::new(
            cluster,
            Utc::now(),
            current.current_active_readers,
            current.average_cpu_utilization,
            predicted,
        );

        if let Err(e) = self.store.put(&snapshot).await {
            warn!(error = %e, "Failed to persist utilization snapshot");
        } else {
            self.bus.publish(Broadcast::new(kind::SNAPSHOT, &snapshot));
        }

        if let Some(historic) = historic {
            let mut prediction = UtilizationSnapshot::new(
                cluster,
                Utc::now()
                    + ChronoDuration::from_std(plan_ahead).unwrap_or_else(|_| ChronoDuration::zero()),
                historic.current_active_readers,
                historic.average_cpu_utilization,
                true,
            );
            prediction.future_value = true;
            self.bus
                .publish(Broadcast::new(kind::PREDICTION, &prediction));
        }
    }
}
