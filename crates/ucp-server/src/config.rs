//! # Daemon Configuration
//!
//! Everything the daemon reads from the environment. Engine tuning lives in
//! [`EngineConfig`]; this adds file locations, the sweep cadence and log
//! output.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use ucp_engine::EngineConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Anything but `json` (case-insensitive) is the human-readable format
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Environment (development, staging, production)
    pub environment: String,
    /// How often the expiry and reconciliation sweep runs
    pub sweep_interval: Duration,
    /// Business profile TOML
    pub profile_path: PathBuf,
    /// Webhook subscriptions TOML
    pub webhooks_path: PathBuf,
    /// redb ledger file
    pub ledger_path: PathBuf,
    /// Hex Ed25519 public key for the profile's merchant
    pub merchant_public_key: Option<String>,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `ENVIRONMENT` | `development` |
    /// | `UCP_SWEEP_INTERVAL_SECS` | 5 |
    /// | `UCP_PROFILE_PATH` | `config/business.toml` |
    /// | `UCP_WEBHOOKS_PATH` | `config/webhooks.toml` |
    /// | `UCP_LEDGER_PATH` | `data/ledger.redb` |
    /// | `UCP_MERCHANT_PUBLIC_KEY` | unset |
    /// | `LOG_FORMAT` | `pretty` |
    ///
    /// plus everything [`EngineConfig::from_env`] reads.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let sweep_secs: u64 = match std::env::var("UCP_SWEEP_INTERVAL_SECS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("UCP_SWEEP_INTERVAL_SECS must be an integer, got {raw:?}"))?,
            Err(_) => 5,
        };
        anyhow::ensure!(sweep_secs > 0, "UCP_SWEEP_INTERVAL_SECS must be positive");

        Ok(Self {
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            sweep_interval: Duration::from_secs(sweep_secs),
            profile_path: path_var("UCP_PROFILE_PATH", "config/business.toml"),
            webhooks_path: path_var("UCP_WEBHOOKS_PATH", "config/webhooks.toml"),
            ledger_path: path_var("UCP_LEDGER_PATH", "data/ledger.redb"),
            merchant_public_key: std::env::var("UCP_MERCHANT_PUBLIC_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            log_format: LogFormat::from_env(),
            engine: EngineConfig::from_env().context("invalid engine configuration")?,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            sweep_interval: Duration::from_secs(5),
            profile_path: PathBuf::from("config/business.toml"),
            webhooks_path: PathBuf::from("config/webhooks.toml"),
            ledger_path: PathBuf::from("data/ledger.redb"),
            merchant_public_key: None,
            log_format: LogFormat::Pretty,
            engine: EngineConfig::default(),
        }
    }
}

fn path_var(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.profile_path, PathBuf::from("config/business.toml"));
        assert_eq!(config.ledger_path, PathBuf::from("data/ledger.redb"));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert!(!config.is_production());
    }
}
