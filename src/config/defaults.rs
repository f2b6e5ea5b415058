//! Default values for scaler configuration

/// Prefix for replica identifiers provisioned by the scaler
pub const DEFAULT_INSTANCE_NAME_PREFIX: &str = "predictive-autoscaling-";

/// Minimum cluster size (writer counted in)
pub const DEFAULT_MIN_INSTANCES: u32 = 2;

/// Maximum cluster size (writer counted in)
pub const DEFAULT_MAX_INSTANCES: u32 = 5;

/// Target average CPU utilization in percent
pub const DEFAULT_TARGET_CPU_UTIL: f64 = 70.0;

/// Initial look-ahead for the historic query; grows with observed
/// provisioning latency and never shrinks
pub const DEFAULT_PLAN_AHEAD: &str = "10m";

/// Port for the dashboard HTTP/WebSocket server
pub const DEFAULT_SERVER_PORT: u16 = 8041;

/// Log filter used when RUST_LOG is not set
pub const DEFAULT_LOG_LEVEL: &str = "info";
