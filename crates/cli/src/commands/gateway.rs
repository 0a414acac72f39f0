//! `distillery serve` — Start the HTTP API server.

use distillery_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Distillery Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {}", config.store.backend);
    println!("   Snapshots: {}", config.snapshots.dir);
    println!("   LLM:       {}", if config.has_api_key() { "configured" } else { "off" });

    distillery_gateway::start(config).await?;

    Ok(())
}
