use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            log_file: "ridematch.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            matching: MatchingConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Matching engine and fee policy settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Driver-selection window in seconds (3 minutes)
    pub selection_window_secs: u64,
    /// Abandonment TTL for unpaid pending requests, in seconds (5 minutes)
    pub pending_ttl_secs: u64,
    /// Flat component of the upfront fee
    pub base_fee: rust_decimal::Decimal,
    /// Per-hour component of the upfront fee
    pub per_hour_rate: rust_decimal::Decimal,
    /// Platform cut of the final ride cost, in percent
    pub platform_fee_percent: rust_decimal::Decimal,
    /// Credits granted per confirmed payment
    pub credits_per_payment: rust_decimal::Decimal,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            selection_window_secs: 3 * 60,
            pending_ttl_secs: 5 * 60,
            base_fee: rust_decimal::Decimal::from(5),
            per_hour_rate: rust_decimal::Decimal::from(2),
            platform_fee_percent: rust_decimal::Decimal::from(10),
            credits_per_payment: rust_decimal::Decimal::ONE,
        }
    }
}

impl MatchingConfig {
    pub fn selection_window(&self) -> Duration {
        Duration::from_secs(self.selection_window_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

/// Payment gateway call settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Upper bound on any single gateway call, in milliseconds
    pub call_timeout_ms: u64,
    pub currency: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            currency: "USD".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file is absent.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.matching.selection_window_secs, 180);
        assert_eq!(config.matching.pending_ttl_secs, 300);
        assert_eq!(config.gateway.call_timeout_ms, 10_000);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
log_level: debug
log_dir: /tmp/logs
log_file: test.log
use_json: true
rotation: hourly
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.use_json);
        // Missing sections come from Default
        assert_eq!(config.matching.selection_window_secs, 180);
        assert_eq!(config.gateway.currency, "USD");
    }
}
