//! Test support
//!
//! In-memory stand-ins for the cloud provider and the snapshot store, used
//! by the unit tests in this crate and the integration tests under
//! `tests/`. The cluster fake models the same eventually-consistent,
//! poll-observed lifecycle the real provider exposes: instances can be given
//! a queue of states they pass through on successive describe calls.

use crate::cloud::{CloudProvider, CpuSample, DbInstance, InstanceState, StatusFilter};
use crate::error::{Result, ScalerError};
use crate::history::SnapshotStore;
use crate::types::{truncate_to_bucket, UtilizationSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// One reader slot in the fake cluster
struct ReaderSlot {
    instance: DbInstance,
    /// States reported on successive describe calls before settling on
    /// `instance.state`
    state_queue: VecDeque<InstanceState>,
    cpu: f64,
}

struct ClusterInner {
    writer: DbInstance,
    writer_cpu: f64,
    readers: Vec<ReaderSlot>,
    history: Vec<CpuSample>,
    /// States newly created replicas pass through before `available`
    provision_sequence: Vec<InstanceState>,
    created: Vec<String>,
    deleted: Vec<String>,
    last_history_query: Option<(DateTime<Utc>, DateTime<Utc>, Duration)>,
    fail_describe: bool,
}

/// In-memory cluster fake implementing [`CloudProvider`]
pub struct TestCluster {
    inner: Mutex<ClusterInner>,
}

fn instance(identifier: &str, is_writer: bool, state: InstanceState) -> DbInstance {
    DbInstance {
        identifier: identifier.to_string(),
        is_writer,
        state,
        instance_class: Some("db.r6g.large".to_string()),
        engine: Some("aurora-postgresql".to_string()),
        multi_az: Some(false),
        copy_tags_to_snapshot: Some(true),
        auto_minor_version_upgrade: Some(true),
        parameter_group: Some("default.aurora-postgresql15".to_string()),
        ca_certificate_identifier: Some("rds-ca-rsa2048-g1".to_string()),
    }
}

impl TestCluster {
    /// A cluster with just an available writer at the given CPU
    pub fn with_writer(writer_cpu: f64) -> Self {
        Self {
            inner: Mutex::new(ClusterInner {
                writer: instance("writer-1", true, InstanceState::Available),
                writer_cpu,
                readers: Vec::new(),
                history: Vec::new(),
                provision_sequence: Vec::new(),
                created: Vec::new(),
                deleted: Vec::new(),
                last_history_query: None,
                fail_describe: false,
            }),
        }
    }

    pub fn set_writer_cpu(&self, cpu: f64) {
        self.inner.lock().writer_cpu = cpu;
    }

    /// Add a reader in the given state reporting the given CPU
    pub fn add_reader(&self, identifier: &str, state: InstanceState, cpu: f64) {
        let mut inner = self.inner.lock();
        inner.readers.push(ReaderSlot {
            instance: instance(identifier, false, state),
            state_queue: VecDeque::new(),
            cpu,
        });
    }

    /// Queue transitional states a reader reports before its settled state
    pub fn queue_states(&self, identifier: &str, states: Vec<InstanceState>) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner
            .readers
            .iter_mut()
            .find(|slot| slot.instance.identifier == identifier)
        {
            slot.state_queue = states.into();
        }
    }

    /// States that freshly created replicas pass through
    pub fn set_provision_sequence(&self, states: Vec<InstanceState>) {
        self.inner.lock().provision_sequence = states;
    }

    /// Configure the cluster-level CPU history returned to the engine
    pub fn set_history(&self, samples: Vec<CpuSample>) {
        self.inner.lock().history = samples;
    }

    pub fn set_fail_describe(&self, fail: bool) {
        self.inner.lock().fail_describe = fail;
    }

    pub fn created_replicas(&self) -> Vec<String> {
        self.inner.lock().created.clone()
    }

    pub fn deleted_replicas(&self) -> Vec<String> {
        self.inner.lock().deleted.clone()
    }

    /// The (start, end, period) of the most recent history query
    pub fn last_history_query(&self) -> Option<(DateTime<Utc>, DateTime<Utc>, Duration)> {
        self.inner.lock().last_history_query
    }
}

#[async_trait]
impl CloudProvider for TestCluster {
    async fn writer_instance(&self) -> Result<DbInstance> {
        let inner = self.inner.lock();
        if inner.fail_describe {
            return Err(ScalerError::provider("describe_cluster", "injected failure"));
        }
        Ok(inner.writer.clone())
    }

    async fn reader_instances(&self, filter: StatusFilter) -> Result<Vec<DbInstance>> {
        let inner = self.inner.lock();
        if inner.fail_describe {
            return Err(ScalerError::provider(
                "describe_instances",
                "injected failure",
            ));
        }
        Ok(inner
            .readers
            .iter()
            .map(|slot| slot.instance.clone())
            .filter(|instance| filter.matches(&instance.state))
            .collect())
    }

    async fn instance_cpu_average(&self, identifier: &str, _window: Duration) -> Result<f64> {
        let inner = self.inner.lock();
        if inner.writer.identifier == identifier {
            return Ok(inner.writer_cpu);
        }
        inner
            .readers
            .iter()
            .find(|slot| slot.instance.identifier == identifier)
            .map(|slot| slot.cpu)
            .ok_or_else(|| {
                ScalerError::provider("get_metric_data", format!("no data for {identifier}"))
            })
    }

    async fn cluster_cpu_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Duration,
    ) -> Result<Vec<CpuSample>> {
        let mut inner = self.inner.lock();
        inner.last_history_query = Some((start, end, period));
        Ok(inner.history.clone())
    }

    async fn create_reader(&self, identifier: &str, template: &DbInstance) -> Result<()> {
        let mut inner = self.inner.lock();
        // new replicas surface in the provisioning state first and walk the
        // configured sequence as they are polled
        let mut sequence: VecDeque<InstanceState> = inner.provision_sequence.clone().into();
        let initial = sequence.pop_front().unwrap_or(InstanceState::Available);
        sequence.push_back(InstanceState::Available);

        let mut created = instance(identifier, false, initial);
        created.instance_class = template.instance_class.clone();
        created.engine = template.engine.clone();
        inner.readers.push(ReaderSlot {
            instance: created,
            state_queue: sequence,
            cpu: 0.0,
        });
        inner.created.push(identifier.to_string());
        Ok(())
    }

    async fn delete_reader(&self, identifier: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.writer.identifier == identifier {
            return Err(ScalerError::provider(
                "delete_reader",
                "refusing to delete the writer",
            ));
        }
        inner
            .readers
            .retain(|slot| slot.instance.identifier != identifier);
        inner.deleted.push(identifier.to_string());
        Ok(())
    }

    async fn instance_state(&self, identifier: &str) -> Result<Option<InstanceState>> {
        let mut inner = self.inner.lock();
        if inner.writer.identifier == identifier {
            return Ok(Some(inner.writer.state.clone()));
        }
        Ok(inner
            .readers
            .iter_mut()
            .find(|slot| slot.instance.identifier == identifier)
            .map(|slot| {
                // each poll advances the queued transition and the settled
                // state follows the last observation
                if let Some(next) = slot.state_queue.pop_front() {
                    slot.instance.state = next;
                }
                slot.instance.state.clone()
            }))
    }
}

/// In-memory snapshot store keyed on (cluster, 10 s bucket)
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<BTreeMap<(String, i64), UtilizationSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<UtilizationSnapshot> {
        self.entries.lock().values().cloned().collect()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot: &UtilizationSnapshot) -> Result<()> {
        let mut snapshot = snapshot.clone();
        snapshot.timestamp = truncate_to_bucket(snapshot.timestamp);
        self.entries.lock().insert(
            (snapshot.cluster_name.clone(), snapshot.timestamp.timestamp()),
            snapshot,
        );
        Ok(())
    }

    async fn range_by_cluster(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UtilizationSnapshot>> {
        let entries = self.entries.lock();
        Ok(entries
            .range((cluster.to_string(), start.timestamp())..=(cluster.to_string(), end.timestamp()))
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_state_queue_drains() {
        let cluster = TestCluster::with_writer(10.0);
        cluster.add_reader("r1", InstanceState::Modifying, 20.0);
        cluster.queue_states(
            "r1",
            vec![InstanceState::Modifying, InstanceState::Available],
        );

        assert_eq!(
            cluster.instance_state("r1").await.unwrap(),
            Some(InstanceState::Modifying)
        );
        // the settled state follows the observed transition
        assert_eq!(
            cluster.instance_state("r1").await.unwrap(),
            Some(InstanceState::Available)
        );
        assert_eq!(
            cluster.instance_state("r1").await.unwrap(),
            Some(InstanceState::Available)
        );
        let readers = cluster.reader_instances(StatusFilter::Any).await.unwrap();
        assert!(readers[0].state.is_available());
    }

    #[tokio::test]
    async fn test_cluster_create_and_delete() {
        let cluster = TestCluster::with_writer(10.0);
        let writer = cluster.writer_instance().await.unwrap();
        cluster.create_reader("new-reader", &writer).await.unwrap();

        let readers = cluster.reader_instances(StatusFilter::Any).await.unwrap();
        assert_eq!(readers.len(), 1);
        assert_eq!(cluster.created_replicas(), vec!["new-reader".to_string()]);

        cluster.delete_reader("new-reader").await.unwrap();
        assert_eq!(cluster.instance_state("new-reader").await.unwrap(), None);
        assert!(cluster.delete_reader("writer-1").await.is_err());
    }
}
