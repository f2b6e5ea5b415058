//! Error types for the predictive scaler
//!
//! Startup failures (configuration, cloud session, store bootstrap) propagate
//! out of `main` and terminate the process. Everything the tick loop hits is
//! logged and retried on the next tick.

use thiserror::Error;

/// Result type alias for scaler operations
pub type Result<T> = std::result::Result<T, ScalerError>;

/// Errors produced by the scaler and its adapters
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cloud provider error during {op}: {message}")]
    Provider { op: &'static str, message: String },

    #[error("cluster metrics unavailable: {0}")]
    MetricsUnavailable(String),

    #[error("no historic data available for the requested window")]
    NoHistoricData,

    #[error("cluster is already at the maximum of {0} instances")]
    AtMax(u32),

    #[error("cluster is already at the minimum of {0} instances")]
    AtMin(u32),

    #[error("a scaling operation is already in flight")]
    ScalingBusy,

    #[error("snapshot store error: {0}")]
    Store(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScalerError {
    /// Build a provider error from any displayable SDK failure
    pub fn provider(op: &'static str, err: impl std::fmt::Display) -> Self {
        ScalerError::Provider {
            op,
            message: err.to_string(),
        }
    }

    /// Benign outcomes that end a tick without signalling a fault
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ScalerError::AtMax(_)
                | ScalerError::AtMin(_)
                | ScalerError::ScalingBusy
                | ScalerError::NoHistoricData
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_message() {
        let err = ScalerError::provider("create_reader", "throttled");
        assert_eq!(
            err.to_string(),
            "cloud provider error during create_reader: throttled"
        );
    }

    #[test]
    fn test_benign_classification() {
        assert!(ScalerError::AtMax(5).is_benign());
        assert!(ScalerError::AtMin(2).is_benign());
        assert!(ScalerError::ScalingBusy.is_benign());
        assert!(ScalerError::NoHistoricData.is_benign());
        assert!(!ScalerError::Config("bad".to_string()).is_benign());
        assert!(!ScalerError::provider("op", "boom").is_benign());
    }
}
