//! AWS implementation of the cloud provider
//!
//! Wraps the RDS and CloudWatch SDK clients. All SDK failures are mapped into
//! `ScalerError::Provider` at this boundary; nothing above this module sees
//! SDK error types.

use super::{CloudProvider, CpuSample, DbInstance, InstanceState, StatusFilter};
use crate::error::{Result, ScalerError};
use async_trait::async_trait;
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::{Dimension, Metric, MetricDataQuery, MetricStat, ScanBy};
use aws_sdk_rds::types::DbInstance as RdsDbInstance;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

const RDS_NAMESPACE: &str = "AWS/RDS";
const CPU_METRIC: &str = "CPUUtilization";

/// Cloud provider backed by the AWS SDK
pub struct AwsCloudProvider {
    rds: aws_sdk_rds::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
    cluster_identifier: String,
}

impl AwsCloudProvider {
    /// Build RDS + CloudWatch clients from a loaded SDK configuration
    pub fn new(sdk_config: &aws_config::SdkConfig, cluster_identifier: impl Into<String>) -> Self {
        Self {
            rds: aws_sdk_rds::Client::new(sdk_config),
            cloudwatch: aws_sdk_cloudwatch::Client::new(sdk_config),
            cluster_identifier: cluster_identifier.into(),
        }
    }

    /// Identifier of the writer member, from the cluster description
    async fn writer_identifier(&self) -> Result<String> {
        let output = self
            .rds
            .describe_db_clusters()
            .db_cluster_identifier(&self.cluster_identifier)
            .send()
            .await
            .map_err(|e| ScalerError::provider("describe_cluster", e))?;

        let cluster = output.db_clusters().first().ok_or_else(|| {
            ScalerError::provider(
                "describe_cluster",
                format!("cluster not found: {}", self.cluster_identifier),
            )
        })?;

        cluster
            .db_cluster_members()
            .iter()
            .find(|member| member.is_cluster_writer().unwrap_or(false))
            .and_then(|member| member.db_instance_identifier())
            .map(str::to_string)
            .ok_or_else(|| {
                ScalerError::provider(
                    "describe_cluster",
                    format!("writer not found in cluster: {}", self.cluster_identifier),
                )
            })
    }

    async fn describe_members(&self) -> Result<Vec<RdsDbInstance>> {
        let filter = aws_sdk_rds::types::Filter::builder()
            .name("db-cluster-id")
            .values(&self.cluster_identifier)
            .build();

        let output = self
            .rds
            .describe_db_instances()
            .filters(filter)
            .send()
            .await
            .map_err(|e| ScalerError::provider("describe_instances", e))?;

        Ok(output.db_instances().to_vec())
    }
}

#[async_trait]
impl CloudProvider for AwsCloudProvider {
    async fn writer_instance(&self) -> Result<DbInstance> {
        let writer_id = self.writer_identifier().await?;

        let output = self
            .rds
            .describe_db_instances()
            .db_instance_identifier(&writer_id)
            .send()
            .await
            .map_err(|e| ScalerError::provider("describe_instances", e))?;

        output
            .db_instances()
            .first()
            .map(|instance| map_instance(instance, true))
            .ok_or_else(|| {
                ScalerError::provider(
                    "describe_instances",
                    format!("writer instance not found: {writer_id}"),
                )
            })
    }

    async fn reader_instances(&self, filter: StatusFilter) -> Result<Vec<DbInstance>> {
        let writer_id = self.writer_identifier().await?;
        let members = self.describe_members().await?;

        Ok(members
            .iter()
            .filter(|instance| instance.db_instance_identifier() != Some(writer_id.as_str()))
            .map(|instance| map_instance(instance, false))
            .filter(|instance| filter.matches(&instance.state))
            .collect())
    }

    async fn instance_cpu_average(&self, identifier: &str, window: Duration) -> Result<f64> {
        let now = Utc::now();
        let query = cpu_query("m1", "DBInstanceIdentifier", identifier, window, "Average")?;

        let output = self
            .cloudwatch
            .get_metric_data()
            .metric_data_queries(query)
            .start_time(to_aws_time(
                now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            ))
            .end_time(to_aws_time(now))
            .send()
            .await
            .map_err(|e| ScalerError::provider("get_metric_data", e))?;

        output
            .metric_data_results()
            .first()
            .and_then(|result| result.values().first())
            .copied()
            .ok_or_else(|| {
                ScalerError::provider(
                    "get_metric_data",
                    format!("no {CPU_METRIC} data for {identifier}"),
                )
            })
    }

    async fn cluster_cpu_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Duration,
    ) -> Result<Vec<CpuSample>> {
        let cluster = self.cluster_identifier.as_str();
        let output = self
            .cloudwatch
            .get_metric_data()
            .metric_data_queries(cpu_query(
                "cpu",
                "DBClusterIdentifier",
                cluster,
                period,
                "Average",
            )?)
            .metric_data_queries(cpu_query(
                "samples",
                "DBClusterIdentifier",
                cluster,
                period,
                "SampleCount",
            )?)
            .start_time(to_aws_time(start))
            .end_time(to_aws_time(end))
            .scan_by(ScanBy::TimestampAscending)
            .send()
            .await
            .map_err(|e| ScalerError::provider("get_metric_data", e))?;

        let results = output.metric_data_results();
        let cpu = results.iter().find(|r| r.id() == Some("cpu"));
        let samples = results.iter().find(|r| r.id() == Some("samples"));

        let (cpu, samples) = match (cpu, samples) {
            (Some(cpu), Some(samples)) => (cpu, samples),
            _ => return Ok(Vec::new()),
        };

        let history: Vec<CpuSample> = cpu
            .timestamps()
            .iter()
            .zip(cpu.values())
            .zip(samples.values())
            .map(|((timestamp, average_cpu), sample_count)| CpuSample {
                timestamp: from_aws_time(timestamp),
                average_cpu: *average_cpu,
                sample_count: *sample_count,
            })
            .collect();

        debug!(
            cluster = %self.cluster_identifier,
            points = history.len(),
            "Retrieved cluster CPU history"
        );
        Ok(history)
    }

    async fn create_reader(&self, identifier: &str, template: &DbInstance) -> Result<()> {
        self.rds
            .create_db_instance()
            .db_cluster_identifier(&self.cluster_identifier)
            .db_instance_identifier(identifier)
            .publicly_accessible(false)
            .set_db_instance_class(template.instance_class.clone())
            .set_engine(template.engine.clone())
            .set_multi_az(template.multi_az)
            .set_copy_tags_to_snapshot(template.copy_tags_to_snapshot)
            .set_auto_minor_version_upgrade(template.auto_minor_version_upgrade)
            .set_db_parameter_group_name(template.parameter_group.clone())
            .set_ca_certificate_identifier(template.ca_certificate_identifier.clone())
            .send()
            .await
            .map_err(|e| ScalerError::provider("create_reader", e))?;
        Ok(())
    }

    async fn delete_reader(&self, identifier: &str) -> Result<()> {
        self.rds
            .delete_db_instance()
            .db_instance_identifier(identifier)
            .skip_final_snapshot(true)
            .send()
            .await
            .map_err(|e| ScalerError::provider("delete_reader", e))?;
        Ok(())
    }

    async fn instance_state(&self, identifier: &str) -> Result<Option<InstanceState>> {
        let result = self
            .rds
            .describe_db_instances()
            .db_instance_identifier(identifier)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output
                .db_instances()
                .first()
                .and_then(|instance| instance.db_instance_status())
                .map(InstanceState::parse)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_db_instance_not_found_fault() {
                    Ok(None)
                } else {
                    Err(ScalerError::provider("describe_instances", service_err))
                }
            }
        }
    }
}

/// Build a CPUUtilization metric query for one dimension
fn cpu_query(
    id: &str,
    dimension: &str,
    value: &str,
    period: Duration,
    stat: &str,
) -> Result<MetricDataQuery> {
    let dimension = Dimension::builder().name(dimension).value(value).build();

    let metric_stat = MetricStat::builder()
        .metric(
            Metric::builder()
                .namespace(RDS_NAMESPACE)
                .metric_name(CPU_METRIC)
                .dimensions(dimension)
                .build(),
        )
        .period(period.as_secs() as i32)
        .stat(stat)
        .build();

    Ok(MetricDataQuery::builder()
        .id(id)
        .metric_stat(metric_stat)
        .return_data(true)
        .build())
}

/// Map an SDK instance description into the scaler's view
fn map_instance(instance: &RdsDbInstance, is_writer: bool) -> DbInstance {
    DbInstance {
        identifier: instance
            .db_instance_identifier()
            .unwrap_or_default()
            .to_string(),
        is_writer,
        state: InstanceState::parse(instance.db_instance_status().unwrap_or_default()),
        instance_class: instance.db_instance_class().map(str::to_string),
        engine: instance.engine().map(str::to_string),
        multi_az: instance.multi_az(),
        copy_tags_to_snapshot: instance.copy_tags_to_snapshot(),
        auto_minor_version_upgrade: instance.auto_minor_version_upgrade(),
        parameter_group: instance
            .db_parameter_groups()
            .first()
            .and_then(|group| group.db_parameter_group_name())
            .map(str::to_string),
        ca_certificate_identifier: instance.ca_certificate_identifier().map(str::to_string),
    }
}

fn to_aws_time(ts: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs(ts.timestamp())
}

fn from_aws_time(ts: &AwsDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_instance_fields() {
        let raw = RdsDbInstance::builder()
            .db_instance_identifier("writer-1")
            .db_instance_status("available")
            .db_instance_class("db.r6g.large")
            .engine("aurora-postgresql")
            .multi_az(false)
            .copy_tags_to_snapshot(true)
            .auto_minor_version_upgrade(true)
            .ca_certificate_identifier("rds-ca-rsa2048-g1")
            .build();

        let mapped = map_instance(&raw, true);
        assert_eq!(mapped.identifier, "writer-1");
        assert!(mapped.is_writer);
        assert_eq!(mapped.state, InstanceState::Available);
        assert_eq!(mapped.instance_class.as_deref(), Some("db.r6g.large"));
        assert_eq!(mapped.engine.as_deref(), Some("aurora-postgresql"));
        assert_eq!(mapped.multi_az, Some(false));
        assert_eq!(
            mapped.ca_certificate_identifier.as_deref(),
            Some("rds-ca-rsa2048-g1")
        );
    }

    #[test]
    fn test_map_instance_unknown_status() {
        let raw = RdsDbInstance::builder()
            .db_instance_identifier("reader-1")
            .db_instance_status("storage-optimization")
            .build();
        let mapped = map_instance(&raw, false);
        assert_eq!(
            mapped.state,
            InstanceState::Other("storage-optimization".to_string())
        );
        assert!(mapped.state.is_deletable());
    }

    #[test]
    fn test_time_conversion_round_trip() {
        let now = Utc::now();
        let converted = from_aws_time(&to_aws_time(now));
        assert_eq!(converted.timestamp(), now.timestamp());
    }
}
