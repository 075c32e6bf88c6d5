//! `clawlink serve` — Start the WebSocket gateway.

use clawlink_config::AppConfig;
use tracing::warn;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    if !config.has_api_key() {
        warn!("No API key configured (set CLAWLINK_API_KEY or OPENAI_API_KEY); only keyless endpoints will work");
    }

    println!("ClawLink Gateway");
    println!("   Listening: ws://{}:{}/v1/ws?session=<code>", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.provider.model);
    println!("   Store:     {:?}", config.persistence.backend);

    clawlink_gateway::start(config).await?;

    Ok(())
}
