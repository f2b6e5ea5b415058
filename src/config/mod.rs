//! Scaler configuration
//!
//! `Config` is assembled from CLI arguments (with env fallbacks), validated
//! once at startup, and then shared behind [`ConfigCell`]. Identity fields
//! (cluster, region, prefix, port) are fixed for the process lifetime; the
//! sizing fields can be patched live by dashboard `conf_update` messages.
//! The plan-ahead duration is deliberately NOT stored here — it lives in a
//! monotonic atomic cell owned by the scaler runtime state.

mod args;
mod defaults;

pub use args::CliArgs;
pub use defaults::*;

use crate::error::{Result, ScalerError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Validated scaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster_identifier: String,
    pub region: String,
    pub instance_name_prefix: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub target_cpu_util: f64,
    /// UTC hours during which the effective minimum is raised by one
    pub boost_hours: BTreeSet<u8>,
    /// Initial look-ahead; the live value is owned by the runtime state
    #[serde(with = "duration_secs")]
    pub plan_ahead_time: Duration,
    pub server_port: u16,
}

impl Config {
    /// Build and validate a configuration from parsed CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self {
            cluster_identifier: args.rds_cluster_name,
            region: args.aws_region,
            instance_name_prefix: args.instance_name_prefix,
            min_instances: args.min_instances,
            max_instances: args.max_instances,
            target_cpu_util: args.target_cpu_utilization,
            boost_hours: parse_boost_hours(&args.boost_hours)?,
            plan_ahead_time: args.plan_ahead_time,
            server_port: args.server_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that must hold before the scaler starts
    pub fn validate(&self) -> Result<()> {
        if self.cluster_identifier.is_empty() {
            return Err(ScalerError::Config(
                "cluster identifier must not be empty".to_string(),
            ));
        }
        if self.region.is_empty() {
            return Err(ScalerError::Config("region must not be empty".to_string()));
        }
        if self.min_instances == 0 {
            return Err(ScalerError::Config(
                "min_instances must be at least 1".to_string(),
            ));
        }
        if self.max_instances < self.min_instances {
            return Err(ScalerError::Config(
                "max_instances must be >= min_instances".to_string(),
            ));
        }
        if self.target_cpu_util <= 0.0 || self.target_cpu_util > 100.0 {
            return Err(ScalerError::Config(
                "target_cpu_util must be in (0, 100]".to_string(),
            ));
        }
        if let Some(hour) = self.boost_hours.iter().find(|&&hour| hour > 23) {
            return Err(ScalerError::Config(format!(
                "boost hour out of range: {hour}"
            )));
        }
        if self.plan_ahead_time.is_zero() {
            return Err(ScalerError::Config(
                "plan_ahead_time must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// True iff the given UTC hour is configured as a boost hour
    pub fn is_boost_hour(&self, utc_hour: u8) -> bool {
        self.boost_hours.contains(&utc_hour)
    }
}

/// Parse a comma-separated list of UTC hours, e.g. "7,9,10"
pub fn parse_boost_hours(input: &str) -> Result<BTreeSet<u8>> {
    let mut hours = BTreeSet::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let hour: u8 = part
            .parse()
            .map_err(|_| ScalerError::Config(format!("invalid boost hour: {part}")))?;
        if hour > 23 {
            return Err(ScalerError::Config(format!(
                "boost hour out of range: {hour}"
            )));
        }
        hours.insert(hour);
    }
    Ok(hours)
}

/// Live configuration patch sent by dashboard clients; fields mirror the
/// wire shape of [`Config`] itself, so a client can echo values from the
/// `config` broadcast back unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    pub target_cpu_util: Option<f64>,
    pub boost_hours: Option<BTreeSet<u8>>,
}

/// Shared, live-updatable configuration cell
#[derive(Debug)]
pub struct ConfigCell {
    inner: RwLock<Config>,
}

/// Handle type passed through the components
pub type SharedConfig = Arc<ConfigCell>;

impl ConfigCell {
    pub fn new(config: Config) -> SharedConfig {
        Arc::new(Self {
            inner: RwLock::new(config),
        })
    }

    /// Snapshot the current configuration
    pub fn get(&self) -> Config {
        self.inner.read().clone()
    }

    /// Apply a dashboard patch; rejected wholesale if the result would be
    /// invalid, so a bad update can never wedge the controller
    pub fn apply_update(&self, update: ConfigUpdate) -> Result<Config> {
        let mut candidate = self.get();
        if let Some(min) = update.min_instances {
            candidate.min_instances = min;
        }
        if let Some(max) = update.max_instances {
            candidate.max_instances = max;
        }
        if let Some(target) = update.target_cpu_util {
            candidate.target_cpu_util = target;
        }
        if let Some(hours) = update.boost_hours {
            candidate.boost_hours = hours;
        }
        candidate.validate()?;

        *self.inner.write() = candidate.clone();
        Ok(candidate)
    }
}

/// Serialize `std::time::Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            cluster_identifier: "demo-cluster".to_string(),
            region: "eu-west-1".to_string(),
            instance_name_prefix: DEFAULT_INSTANCE_NAME_PREFIX.to_string(),
            min_instances: 2,
            max_instances: 5,
            target_cpu_util: 70.0,
            boost_hours: BTreeSet::new(),
            plan_ahead_time: Duration::from_secs(600),
            server_port: DEFAULT_SERVER_PORT,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_min() {
        let mut config = base_config();
        config.min_instances = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_max_below_min() {
        let mut config = base_config();
        config.min_instances = 4;
        config.max_instances = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        let mut config = base_config();
        config.target_cpu_util = 0.0;
        assert!(config.validate().is_err());
        config.target_cpu_util = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_boost_hours() {
        let hours = parse_boost_hours("7, 9,10").unwrap();
        assert_eq!(hours, BTreeSet::from([7, 9, 10]));
        assert!(parse_boost_hours("").unwrap().is_empty());
        assert!(parse_boost_hours("24").is_err());
        assert!(parse_boost_hours("seven").is_err());
    }

    #[test]
    fn test_is_boost_hour() {
        let mut config = base_config();
        config.boost_hours = BTreeSet::from([9]);
        assert!(config.is_boost_hour(9));
        assert!(!config.is_boost_hour(10));
    }

    #[test]
    fn test_apply_update_patches_sizing_fields() {
        let cell = ConfigCell::new(base_config());
        let updated = cell
            .apply_update(ConfigUpdate {
                min_instances: Some(3),
                target_cpu_util: Some(60.0),
                boost_hours: Some(BTreeSet::from([8, 18])),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.min_instances, 3);
        assert_eq!(updated.target_cpu_util, 60.0);
        assert!(updated.boost_hours.contains(&18));
        assert_eq!(cell.get().min_instances, 3);
    }

    #[test]
    fn test_update_payload_matches_config_wire_shape() {
        // a client may echo fields straight out of the `config` broadcast
        let mut config = base_config();
        config.boost_hours = BTreeSet::from([7, 9]);
        let broadcast_json = serde_json::to_value(&config).unwrap();

        let update: ConfigUpdate = serde_json::from_value(broadcast_json).unwrap();
        assert_eq!(update.boost_hours, Some(BTreeSet::from([7, 9])));
        assert_eq!(update.min_instances, Some(2));

        let cell = ConfigCell::new(base_config());
        let applied = cell.apply_update(update).unwrap();
        assert_eq!(applied.boost_hours, BTreeSet::from([7, 9]));
    }

    #[test]
    fn test_apply_update_rejects_out_of_range_boost_hour() {
        let cell = ConfigCell::new(base_config());
        let result = cell.apply_update(ConfigUpdate {
            boost_hours: Some(BTreeSet::from([9, 24])),
            ..Default::default()
        });
        assert!(result.is_err());
        assert!(cell.get().boost_hours.is_empty());
    }

    #[test]
    fn test_validate_rejects_out_of_range_boost_hour() {
        let mut config = base_config();
        config.boost_hours = BTreeSet::from([25]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_update_rejects_invalid_combination() {
        let cell = ConfigCell::new(base_config());
        let result = cell.apply_update(ConfigUpdate {
            min_instances: Some(9),
            ..Default::default()
        });
        assert!(result.is_err());
        // the stored config is untouched
        assert_eq!(cell.get().min_instances, 2);
    }

    #[test]
    fn test_config_broadcast_shape() {
        let json = serde_json::to_string(&base_config()).unwrap();
        assert!(json.contains("\"plan_ahead_time\":600"));
        assert!(json.contains("\"cluster_identifier\":\"demo-cluster\""));
    }
}
