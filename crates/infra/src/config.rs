//! Configuration loading and representation.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file in the working directory.

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use chalak_observability::{LogConfig, LogFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Process configuration, one field per environment variable.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub database_acquire_timeout_secs: u64,

    /// Fraction of the invoice amount charged as tax (`0.16` = 16%).
    #[serde(default)]
    pub invoice_tax_rate: Decimal,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

/// Connection settings handed to the Postgres store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BillingConfig {
    /// Load from `.env` (if present) and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        envy::from_env::<Self>()?.validated()
    }

    /// Load from explicit key/value pairs (upper-case keys, as in the environment).
    pub fn from_iter<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter::<_, Self>(vars)?.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.invoice_tax_rate.is_sign_negative() || self.invoice_tax_rate > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "INVOICE_TAX_RATE must be between 0 and 1, got {}",
                self.invoice_tax_rate
            )));
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn database(&self) -> Result<DatabaseConfig, ConfigError> {
        let url = self
            .database_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        Ok(DatabaseConfig {
            url,
            max_connections: self.database_max_connections,
            acquire_timeout_secs: self.database_acquire_timeout_secs,
        })
    }

    pub fn log(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = BillingConfig::from_iter(vars(&[])).unwrap();
        assert_eq!(cfg.database_max_connections, 10);
        assert_eq!(cfg.database_acquire_timeout_secs, 5);
        assert_eq!(cfg.invoice_tax_rate, Decimal::ZERO);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log().level, "info");
        assert!(matches!(cfg.database(), Err(ConfigError::MissingDatabaseUrl)));
    }

    #[test]
    fn reads_database_and_tax_settings() {
        let cfg = BillingConfig::from_iter(vars(&[
            ("DATABASE_URL", "postgres://chalak@localhost/chalak"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("INVOICE_TAX_RATE", "0.16"),
            ("LOG_FORMAT", "pretty"),
        ]))
        .unwrap();

        let db = cfg.database().unwrap();
        assert_eq!(db.url, "postgres://chalak@localhost/chalak");
        assert_eq!(db.max_connections, 4);
        assert_eq!(cfg.invoice_tax_rate, Decimal::new(16, 2));
        assert_eq!(cfg.log().format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_out_of_range_tax_rate() {
        let err = BillingConfig::from_iter(vars(&[("INVOICE_TAX_RATE", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_connections() {
        let err =
            BillingConfig::from_iter(vars(&[("DATABASE_MAX_CONNECTIONS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
