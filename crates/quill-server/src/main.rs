use anyhow::{Context, Result};
use quill_monitoring::MonitoringConfig;
use quill_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from file and environment variables
    let config = ServerConfig::load().context("Failed to load configuration")?;

    let monitoring_config = MonitoringConfig {
        service_name: "quill-server".to_string(),
        log_filter: config.log_level.clone(),
        enable_json_logging: config.json_logs,
        environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
    };

    quill_monitoring::init(monitoring_config).context("Failed to initialize monitoring")?;

    quill_server::run(config).await.context("Server error")?;

    quill_monitoring::shutdown();
    Ok(())
}
