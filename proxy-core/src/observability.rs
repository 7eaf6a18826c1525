//! Structured logging initialization
//!
//! JSON-formatted `tracing` output, honoring `ServiceConfig.log_level` with
//! an `EnvFilter` fallback to `info`. Systemd-journal output is available
//! behind the `journald` feature for nodes running as native services.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();
    let filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().json().with_env_filter(filter).init();

    tracing::info!(
        node = config.service.hostname.as_deref().unwrap_or("unnamed"),
        "tracing initialized"
    );

    Ok(())
}

#[cfg(feature = "journald")]
pub fn init_journald(identifier: &str) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let journald_layer = tracing_journald::layer()
        .map_err(|e| crate::error::Error::Internal(format!("journald init failed: {e}")))?
        .with_syslog_identifier(identifier.to_string());

    tracing_subscriber::registry()
        .with(journald_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Ok(())
}

pub fn shutdown_tracing() {
    tracing::info!("tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_does_not_panic() {
        let config = Config::default();
        let _ = init_tracing(&config);
    }
}
