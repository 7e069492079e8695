use crate::services::{AlertPolicy, DiscountFallback, EngineSettings};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct EntitlementConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub policy: PolicyConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub discount_fallback: DiscountFallback,
    pub warning_percent: Decimal,
    pub unusual_multiplier: Decimal,
    pub peak_daily_gb: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl EntitlementConfig {
    pub fn from_env() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let backend: StorageBackend = get_env("STORAGE_BACKEND", Some("postgres"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        // The in-memory backend never touches the database settings.
        let database_url = match backend {
            StorageBackend::Postgres => get_env("DATABASE_URL", None, is_prod)?,
            StorageBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
        };

        Ok(EntitlementConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("entitlement-service"), false)?,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            storage: StorageConfig { backend },
            database: DatabaseConfig {
                url: database_url,
                max_connections: parse_env("DB_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "2")?,
            },
            policy: PolicyConfig {
                discount_fallback: parse_env("DISCOUNT_FALLBACK", "full_price")?,
                warning_percent: parse_env("ALERT_WARNING_PERCENT", "80")?,
                unusual_multiplier: parse_env("ALERT_UNUSUAL_MULTIPLIER", "2")?,
                peak_daily_gb: parse_env("ALERT_PEAK_DAILY_GB", "50")?,
            },
            sweep: SweepConfig {
                enabled: parse_env("RENEWAL_SWEEP_ENABLED", "false")?,
                interval_secs: parse_env("RENEWAL_SWEEP_INTERVAL_SECS", "3600")?,
            },
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            discount_fallback: self.policy.discount_fallback,
            alert_policy: AlertPolicy {
                warning_percent: self.policy.warning_percent,
                unusual_multiplier: self.policy.unusual_multiplier,
                peak_daily_gb: self.policy.peak_daily_gb,
            },
        }
    }

    /// Settings for running entirely in memory, used by tests.
    pub fn in_memory() -> Self {
        let defaults = AlertPolicy::default();
        EntitlementConfig {
            common: core_config::Config {
                port: 0,
                ..core_config::Config::default()
            },
            service_name: "entitlement-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            storage: StorageConfig {
                backend: StorageBackend::Memory,
            },
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 1,
                min_connections: 0,
            },
            policy: PolicyConfig {
                discount_fallback: DiscountFallback::FullPrice,
                warning_percent: defaults.warning_percent,
                unusual_multiplier: defaults.unusual_multiplier,
                peak_daily_gb: defaults.peak_daily_gb,
            },
            sweep: SweepConfig {
                enabled: false,
                interval_secs: 3600,
            },
        }
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, Some(default), false)?;
    raw.parse::<T>().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn storage_backend_parses_case_insensitively() {
        assert_eq!("Memory".parse::<StorageBackend>(), Ok(StorageBackend::Memory));
        assert_eq!("postgresql".parse::<StorageBackend>(), Ok(StorageBackend::Postgres));
        assert!("mongo".parse::<StorageBackend>().is_err());
    }

    #[test]
    #[serial]
    fn memory_backend_needs_no_database_url() {
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("DISCOUNT_FALLBACK", "reject");
        env::set_var("ALERT_WARNING_PERCENT", "75");
        env::remove_var("DATABASE_URL");

        let config = EntitlementConfig::from_env().unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);

        let settings = config.engine_settings();
        assert_eq!(settings.discount_fallback, DiscountFallback::Reject);
        assert_eq!(settings.alert_policy.warning_percent, Decimal::from(75));

        env::remove_var("STORAGE_BACKEND");
        env::remove_var("DISCOUNT_FALLBACK");
        env::remove_var("ALERT_WARNING_PERCENT");
    }

    #[test]
    #[serial]
    fn misspelled_discount_fallback_is_a_config_error() {
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("DISCOUNT_FALLBACK", "rejct");

        let err = EntitlementConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DISCOUNT_FALLBACK"));

        env::remove_var("STORAGE_BACKEND");
        env::remove_var("DISCOUNT_FALLBACK");
    }

    #[test]
    #[serial]
    fn malformed_numbers_are_config_errors() {
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("DB_MAX_CONNECTIONS", "many");

        let err = EntitlementConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DB_MAX_CONNECTIONS"));

        env::remove_var("STORAGE_BACKEND");
        env::remove_var("DB_MAX_CONNECTIONS");
    }
}
