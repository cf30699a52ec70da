//! `tether check-config`: validate a config file without connecting.

use std::path::Path;

use anyhow::{Context, Result};
use tether_control::backhaul_url;
use tether_types::AgentConfig;

/// Load the config, apply environment overrides, validate, and print a
/// summary. The agent key is never printed.
pub fn run(path: &Path) -> Result<()> {
    let config = AgentConfig::load(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    let backhaul = backhaul_url(&config.server.url, &config.control.backhaul_path)
        .context("cannot derive backhaul URL")?;

    println!("configuration OK: {}", path.display());
    println!("  server:           {}", config.server.url);
    println!("  agent id:         {}", config.server.id);
    println!("  backhaul:         {backhaul}");
    println!(
        "  tls:              verify={} ca={}",
        config.server.verify_certificate,
        config
            .server
            .ca_certificate
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "system".into())
    );
    println!(
        "  delivery:         workers={} timeout={}s retries={} capacity={}",
        config.delivery.workers,
        config.delivery.request_timeout_secs,
        config.delivery.retry_limit,
        config.delivery.queue_capacity
    );
    println!(
        "  reconnect:        {}s..{}s",
        config.control.reconnect_initial_secs, config.control.reconnect_max_secs
    );
    Ok(())
}
