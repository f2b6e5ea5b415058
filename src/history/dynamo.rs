//! DynamoDB-backed snapshot store
//!
//! Table layout: partition key `cluster_name` (S), sort key `timestamp`
//! (S, RFC3339 so lexicographic order is chronological order), TTL on the
//! `ttl` attribute in unix seconds. The table is created on first use.

use super::SnapshotStore;
use crate::error::{Result, ScalerError};
use crate::types::{truncate_to_bucket, UtilizationSnapshot};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus, TimeToLiveSpecification,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Default table holding utilization snapshots
pub const DEFAULT_TABLE_NAME: &str = "predictive-autoscaling-history";

/// Snapshot store backed by a DynamoDB table
pub struct DynamoSnapshotStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoSnapshotStore {
    /// Connect to the table, creating it (with TTL enabled) if missing
    pub async fn new(sdk_config: &aws_config::SdkConfig) -> Result<Self> {
        Self::with_table(sdk_config, DEFAULT_TABLE_NAME).await
    }

    pub async fn with_table(sdk_config: &aws_config::SdkConfig, table_name: &str) -> Result<Self> {
        let store = Self {
            client: aws_sdk_dynamodb::Client::new(sdk_config),
            table_name: table_name.to_string(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .client
            .list_tables()
            .send()
            .await
            .map_err(|e| ScalerError::Store(format!("failed to list tables: {e}")))?;

        if tables.table_names().contains(&self.table_name) {
            return Ok(());
        }

        info!(table = %self.table_name, "Creating snapshot table");

        let key_attribute = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|e| ScalerError::Store(format!("invalid attribute definition: {e}")))
        };
        let key_element = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|e| ScalerError::Store(format!("invalid key schema: {e}")))
        };

        self.client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(key_attribute("cluster_name")?)
            .attribute_definitions(key_attribute("timestamp")?)
            .key_schema(key_element("cluster_name", KeyType::Hash)?)
            .key_schema(key_element("timestamp", KeyType::Range)?)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| ScalerError::Store(format!("failed to create table: {e}")))?;

        self.wait_until_active().await?;

        let ttl_spec = TimeToLiveSpecification::builder()
            .attribute_name("ttl")
            .enabled(true)
            .build()
            .map_err(|e| ScalerError::Store(format!("invalid TTL specification: {e}")))?;
        self.client
            .update_time_to_live()
            .table_name(&self.table_name)
            .time_to_live_specification(ttl_spec)
            .send()
            .await
            .map_err(|e| ScalerError::Store(format!("failed to enable TTL: {e}")))?;

        info!(table = %self.table_name, "Snapshot table ready, TTL enabled");
        Ok(())
    }

    async fn wait_until_active(&self) -> Result<()> {
        loop {
            let result = self
                .client
                .describe_table()
                .table_name(&self.table_name)
                .send()
                .await;

            match result {
                Ok(output) => {
                    let status = output.table().and_then(|t| t.table_status());
                    if status == Some(&TableStatus::Active) {
                        return Ok(());
                    }
                }
                Err(err) => {
                    let service_err = err.into_service_error();
                    if !service_err.is_resource_not_found_exception() {
                        return Err(ScalerError::Store(format!(
                            "failed to describe table: {service_err}"
                        )));
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait]
impl SnapshotStore for DynamoSnapshotStore {
    async fn put(&self, snapshot: &UtilizationSnapshot) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(
                "cluster_name",
                AttributeValue::S(snapshot.cluster_name.clone()),
            )
            .item(
                "timestamp",
                AttributeValue::S(format_timestamp(snapshot.timestamp)),
            )
            .item(
                "num_readers",
                AttributeValue::N(snapshot.num_readers.to_string()),
            )
            .item(
                "max_cpu_utilization",
                AttributeValue::N(snapshot.max_cpu_utilization.to_string()),
            )
            .item(
                "predicted_value",
                AttributeValue::Bool(snapshot.predicted_value),
            )
            .item("future_value", AttributeValue::Bool(snapshot.future_value))
            .item("ttl", AttributeValue::N(snapshot.ttl.to_string()))
            .send()
            .await
            .map_err(|e| ScalerError::Store(format!("failed to put snapshot: {e}")))?;
        Ok(())
    }

    async fn range_by_cluster(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UtilizationSnapshot>> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("cluster_name = :name AND #ts BETWEEN :start AND :end")
            .expression_attribute_names("#ts", "timestamp")
            .expression_attribute_values(":name", AttributeValue::S(cluster.to_string()))
            .expression_attribute_values(":start", AttributeValue::S(format_timestamp(start)))
            .expression_attribute_values(":end", AttributeValue::S(format_timestamp(end)))
            .send()
            .await
            .map_err(|e| ScalerError::Store(format!("failed to query snapshots: {e}")))?;

        // sort-key order already yields ascending timestamps
        output.items().iter().map(parse_item).collect()
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_item(item: &HashMap<String, AttributeValue>) -> Result<UtilizationSnapshot> {
    let string_of = |key: &str| -> Result<&str> {
        item.get(key)
            .and_then(|v| v.as_s().ok())
            .map(String::as_str)
            .ok_or_else(|| ScalerError::Store(format!("snapshot item missing attribute: {key}")))
    };
    let number_of = |key: &str| -> Result<f64> {
        item.get(key)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ScalerError::Store(format!("snapshot item missing attribute: {key}")))
    };
    let bool_of = |key: &str| -> bool {
        item.get(key)
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false)
    };

    let timestamp = DateTime::parse_from_rfc3339(string_of("timestamp")?)
        .map_err(|e| ScalerError::Store(format!("invalid snapshot timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(UtilizationSnapshot {
        timestamp: truncate_to_bucket(timestamp),
        cluster_name: string_of("cluster_name")?.to_string(),
        num_readers: number_of("num_readers")? as u32,
        max_cpu_utilization: number_of("max_cpu_utilization")?,
        predicted_value: bool_of("predicted_value"),
        future_value: bool_of("future_value"),
        ttl: number_of("ttl")? as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_is_sortable_rfc3339() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 10).unwrap();
        let (a, b) = (format_timestamp(earlier), format_timestamp(later));
        assert_eq!(a, "2024-03-05T12:00:00Z");
        assert!(a < b);
    }

    #[test]
    fn test_parse_item_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 10).unwrap();
        let snapshot = UtilizationSnapshot::new("demo", ts, 3, 61.5, true);

        let mut item = HashMap::new();
        item.insert(
            "cluster_name".to_string(),
            AttributeValue::S(snapshot.cluster_name.clone()),
        );
        item.insert(
            "timestamp".to_string(),
            AttributeValue::S(format_timestamp(snapshot.timestamp)),
        );
        item.insert(
            "num_readers".to_string(),
            AttributeValue::N(snapshot.num_readers.to_string()),
        );
        item.insert(
            "max_cpu_utilization".to_string(),
            AttributeValue::N(snapshot.max_cpu_utilization.to_string()),
        );
        item.insert(
            "predicted_value".to_string(),
            AttributeValue::Bool(snapshot.predicted_value),
        );
        item.insert(
            "future_value".to_string(),
            AttributeValue::Bool(snapshot.future_value),
        );
        item.insert("ttl".to_string(), AttributeValue::N(snapshot.ttl.to_string()));

        assert_eq!(parse_item(&item).unwrap(), snapshot);
    }

    #[test]
    fn test_parse_item_missing_attribute() {
        let item = HashMap::new();
        assert!(parse_item(&item).is_err());
    }
}
