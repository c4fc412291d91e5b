//! Monitoring module for the Quill platform.
//!
//! Structured logging setup plus log-backed resilience metrics.

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to every log line
    pub service_name: String,
    /// Log level filter (e.g., "info,quill_server=debug")
    pub log_filter: String,
    /// Emit JSON lines instead of human-readable output
    pub enable_json_logging: bool,
    /// Environment (dev, staging, prod)
    pub environment: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "quill".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            environment: "dev".to_string(),
        }
    }
}

/// Initialize monitoring system
pub fn init(config: MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(&config)?;

    info!(
        service_name = %config.service_name,
        environment = %config.environment,
        "Monitoring initialized"
    );

    Ok(())
}

/// Shutdown the monitoring system
pub fn shutdown() {
    info!("Shutting down monitoring system");
}


// Exported types
pub use crate::logging::LogExt;
pub use crate::metrics::*;
