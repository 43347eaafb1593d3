use anyhow::Result;
use dotenv::dotenv;
use monitor_service::{MonitorService, MonitorServiceConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting monitor_service...");

    let config = MonitorServiceConfig::from_env()?;
    let service = MonitorService::new(config).await?;

    service.run().await
}
