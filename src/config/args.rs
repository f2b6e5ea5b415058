//! Command-line arguments for the predictive scaler
//!
//! This module defines the CLI arguments structure using clap. Every flag has
//! an environment fallback so the scaler can run flag-less in a container.

use clap::Parser;
use std::time::Duration;

use super::defaults::*;

/// Command-line arguments for the predictive scaler
#[derive(Parser, Debug, Clone)]
#[command(name = "predictive-scaler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Predictive horizontal autoscaler for Aurora-style database clusters")]
pub struct CliArgs {
    /// Identifier of the database cluster to scale
    #[arg(long = "rdsClusterName", env = "RDS_CLUSTER_NAME")]
    pub rds_cluster_name: String,

    /// AWS region the cluster lives in
    #[arg(long = "awsRegion", env = "AWS_REGION")]
    pub aws_region: String,

    /// Prefix for replica identifiers provisioned by the scaler
    #[arg(long = "instanceNamePrefix", env = "INSTANCE_NAME_PREFIX", default_value = DEFAULT_INSTANCE_NAME_PREFIX)]
    pub instance_name_prefix: String,

    /// Minimum cluster size, writer counted in (>= 1)
    #[arg(long = "minInstances", env = "MIN_INSTANCES", default_value_t = DEFAULT_MIN_INSTANCES)]
    pub min_instances: u32,

    /// Maximum cluster size, writer counted in
    #[arg(long = "maxInstances", env = "MAX_INSTANCES", default_value_t = DEFAULT_MAX_INSTANCES)]
    pub max_instances: u32,

    /// Target average CPU utilization in percent (0 < t <= 100)
    #[arg(long = "targetCpuUtilization", env = "TARGET_CPU_UTILIZATION", default_value_t = DEFAULT_TARGET_CPU_UTIL)]
    pub target_cpu_utilization: f64,

    /// Comma-separated UTC hours (0-23) during which the minimum is raised
    /// by one to pre-warm capacity (e.g. '7,9,10')
    #[arg(long = "boostHours", env = "BOOST_HOURS", default_value = "")]
    pub boost_hours: String,

    /// Initial prediction look-ahead, e.g. '10m' or '600s'
    #[arg(long = "planAheadTime", env = "PLAN_AHEAD_TIME", default_value = DEFAULT_PLAN_AHEAD, value_parser = parse_duration)]
    pub plan_ahead_time: Duration,

    /// Port for the dashboard HTTP/WebSocket server
    #[arg(long = "serverPort", env = "SERVER_PORT", default_value_t = DEFAULT_SERVER_PORT)]
    pub server_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "logLevel", env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

/// Parse a duration of the form `90s`, `10m`, `2h` or a bare seconds count
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let (number, unit) = match value.char_indices().rfind(|(_, c)| c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx + 1),
        None => return Err(format!("invalid duration: {value}")),
    };

    let amount: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;

    let secs = match unit {
        "" | "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        other => return Err(format!("unknown duration unit: {other}")),
    };

    Ok(Duration::from_secs(secs))
}
