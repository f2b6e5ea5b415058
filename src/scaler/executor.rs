//! Scaling executor
//!
//! Mutates the cluster toward the desired size. Each operation claims the
//! single-flight slot on entry, runs as a detached task, and releases the
//! slot exactly once when every side effect (including the status waits) has
//! completed, regardless of outcome.

use crate::cloud::{CloudProvider, DbInstance, InstanceState, StatusFilter};
use crate::config::SharedConfig;
use crate::error::{Result, ScalerError};
use crate::scaler::state::RuntimeState;
use crate::server::broadcast::BroadcastBus;
use crate::types::{kind, Broadcast};
use chrono::{Timelike, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Poll interval while waiting for replicas to become available
const AVAILABLE_POLL: Duration = Duration::from_secs(10);

/// Poll interval while waiting for deletable transitions and removal
const DELETE_POLL: Duration = Duration::from_secs(5);

/// Drives scale-out and scale-in operations against the cloud provider
pub struct ScalingExecutor {
    provider: Arc<dyn CloudProvider>,
    config: SharedConfig,
    state: Arc<RuntimeState>,
    bus: BroadcastBus,
    available_poll: Duration,
    delete_poll: Duration,
}

impl ScalingExecutor {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        config: SharedConfig,
        state: Arc<RuntimeState>,
        bus: BroadcastBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            config,
            state,
            bus,
            available_poll: AVAILABLE_POLL,
            delete_poll: DELETE_POLL,
        })
    }

    /// Variant with short poll intervals for tests
    pub fn with_poll_intervals(
        provider: Arc<dyn CloudProvider>,
        config: SharedConfig,
        state: Arc<RuntimeState>,
        bus: BroadcastBus,
        available_poll: Duration,
        delete_poll: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            config,
            state,
            bus,
            available_poll,
            delete_poll,
        })
    }

    /// Claim the scaling slot and run a scale-out in the background
    pub fn begin_scale_out(self: &Arc<Self>, count: u32) -> Result<JoinHandle<()>> {
        if !self.state.try_begin_scaling() {
            return Err(ScalerError::ScalingBusy);
        }
        let executor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if let Err(e) = executor.run_scale_out(count).await {
                log_outcome("scale-out", &e);
            }
            executor.state.finish_scaling();
        }))
    }

    /// Claim the scaling slot and run a scale-in in the background
    pub fn begin_scale_in(self: &Arc<Self>, count: u32) -> Result<JoinHandle<()>> {
        if !self.state.try_begin_scaling() {
            return Err(ScalerError::ScalingBusy);
        }
        let executor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if let Err(e) = executor.run_scale_in(count).await {
                log_outcome("scale-in", &e);
            }
            executor.state.finish_scaling();
        }))
    }

    async fn run_scale_out(&self, mut count: u32) -> Result<()> {
        let config = self.config.get();
        self.publish_scale_event(kind::SCALE_OUT_STATUS, "starting", count, None);

        // replicas that a previous run left mid-provisioning count toward
        // the requested size instead of being duplicated
        let starting = self
            .provider
            .reader_instances(StatusFilter::starting_up())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Could not list starting instances");
                Vec::new()
            });
        if !starting.is_empty() {
            let identifiers: Vec<String> =
                starting.iter().map(|i| i.identifier.clone()).collect();
            info!(
                instances = identifiers.len(),
                "Waiting for already-starting replicas before creating more"
            );
            if let Err(e) = self.wait_for_available(&identifiers).await {
                warn!(error = %e, "Error waiting for starting replicas");
            }
            count = count.saturating_sub(identifiers.len() as u32);
        }

        let mut created: Vec<String> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            // re-fetch the writer each round; it is the template and its
            // configuration may change mid-operation
            let writer = self.provider.writer_instance().await?;
            let readers = self
                .provider
                .reader_instances(StatusFilter::excluding_deleting())
                .await?;
            let current_size = readers.len() as u32 + 1;
            if current_size >= config.max_instances {
                if created.is_empty() {
                    return Err(ScalerError::AtMax(config.max_instances));
                }
                break;
            }

            let identifier = reader_name(&config.instance_name_prefix, Utc::now().hour());
            self.create_reader(&identifier, &writer).await?;
            info!(replica = %identifier, "Replica creation requested");
            self.publish_scale_event(
                kind::SCALE_OUT_STATUS,
                "creating",
                count,
                Some(&identifier),
            );
            created.push(identifier);
        }

        // observe provisioning latency and feed it back into the look-ahead
        let wait_start = Instant::now();
        if let Err(e) = self.wait_for_available(&created).await {
            // the observed cluster state is authoritative from here on
            warn!(error = %e, "Error waiting for new replicas to become available");
        }
        let elapsed = wait_start.elapsed();
        if self.state.plan_ahead.observe_scale_duration(elapsed) {
            info!(
                scale_secs = elapsed.as_secs(),
                plan_ahead_secs = self.state.plan_ahead.get().as_secs(),
                "Raised plan-ahead time to cover provisioning latency"
            );
        }

        self.publish_scale_event(kind::SCALE_OUT_STATUS, "complete", created.len() as u32, None);
        info!(created = created.len(), "Scale-out complete");
        Ok(())
    }

    async fn run_scale_in(&self, count: u32) -> Result<()> {
        let config = self.config.get();
        self.publish_scale_event(kind::SCALE_IN_STATUS, "starting", count, None);

        let mut readers: VecDeque<DbInstance> = self
            .provider
            .reader_instances(StatusFilter::Any)
            .await?
            .into();
        if readers.is_empty() {
            return Err(ScalerError::AtMin(config.min_instances));
        }

        let mut deleted: Vec<String> = Vec::with_capacity(count as usize);
        while (deleted.len() as u32) < count {
            let Some(reader) = readers.pop_front() else {
                break;
            };

            if reader.state == InstanceState::Deleting {
                if readers.is_empty() && deleted.is_empty() {
                    info!(
                        replica = %reader.identifier,
                        "Last remaining reader is already deleting, stopping to avoid disruption"
                    );
                    break;
                }
                info!(replica = %reader.identifier, "Skipping replica already deleting");
                continue;
            }

            self.wait_until_deletable(&reader.identifier).await?;
            self.provider.delete_reader(&reader.identifier).await.map_err(
                |e| {
                    error!(replica = %reader.identifier, error = %e, "Replica deletion failed");
                    e
                },
            )?;
            info!(replica = %reader.identifier, "Replica deletion requested");
            self.publish_scale_event(
                kind::SCALE_IN_STATUS,
                "deleting",
                count,
                Some(&reader.identifier),
            );
            deleted.push(reader.identifier);
        }

        for identifier in &deleted {
            if let Err(e) = self.wait_until_removed(identifier).await {
                warn!(replica = %identifier, error = %e, "Error waiting for replica removal");
            }
        }

        self.publish_scale_event(kind::SCALE_IN_STATUS, "complete", deleted.len() as u32, None);
        info!(removed = deleted.len(), "Scale-in complete");
        Ok(())
    }

    async fn create_reader(&self, identifier: &str, writer: &DbInstance) -> Result<()> {
        self.provider.create_reader(identifier, writer).await
    }

    /// Poll until every listed replica reports `available`
    async fn wait_for_available(&self, identifiers: &[String]) -> Result<()> {
        if identifiers.is_empty() {
            return Ok(());
        }
        loop {
            let mut all_ready = true;
            for identifier in identifiers {
                match self.provider.instance_state(identifier).await? {
                    Some(state) if state.is_available() => {}
                    Some(state) => {
                        info!(replica = %identifier, state = %state, "Replica not yet available");
                        all_ready = false;
                    }
                    None => {
                        // create calls are eventually consistent; the
                        // instance may not be describable yet
                        all_ready = false;
                    }
                }
            }
            if all_ready {
                return Ok(());
            }
            tokio::time::sleep(self.available_poll).await;
        }
    }

    /// Poll until the replica leaves every transitional state
    async fn wait_until_deletable(&self, identifier: &str) -> Result<()> {
        loop {
            match self.provider.instance_state(identifier).await? {
                None => return Ok(()),
                Some(state) if state.is_deletable() => return Ok(()),
                Some(state) => {
                    info!(replica = %identifier, state = %state, "Waiting for replica to become deletable");
                }
            }
            tokio::time::sleep(self.delete_poll).await;
        }
    }

    /// Poll until the replica disappears from the describe output
    async fn wait_until_removed(&self, identifier: &str) -> Result<()> {
        loop {
            match self.provider.instance_state(identifier).await? {
                None => return Ok(()),
                Some(state) => {
                    info!(replica = %identifier, state = %state, "Waiting for replica removal");
                }
            }
            tokio::time::sleep(self.delete_poll).await;
        }
    }

    fn publish_scale_event(&self, kind: &str, phase: &str, count: u32, replica: Option<&str>) {
        self.bus.publish(Broadcast::new(
            kind,
            &json!({
                "phase": phase,
                "count": count,
                "replica": replica,
                "timestamp": Utc::now(),
            }),
        ));
    }
}

fn log_outcome(operation: &str, err: &ScalerError) {
    if err.is_benign() {
        info!(operation = operation, outcome = %err, "Scaling ended early");
    } else {
        error!(operation = operation, error = %err, "Scaling failed");
    }
}

/// Replica identifiers: `<prefix><utcHour>-<8 alphanumeric chars>`
pub fn reader_name(prefix: &str, utc_hour: u32) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{prefix}{utc_hour}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_name_shape() {
        let name = reader_name("predictive-autoscaling-", 9);
        assert!(name.starts_with("predictive-autoscaling-9-"));
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_reader_names_are_unique() {
        let a = reader_name("p-", 12);
        let b = reader_name("p-", 12);
        assert_ne!(a, b);
    }
}
