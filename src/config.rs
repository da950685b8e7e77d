// src/config.rs

use std::env;
use std::net::{IpAddr, SocketAddr};

use chrono::FixedOffset;

use crate::services::erp::DEFAULT_PROCESSES;

/// Process-level configuration read from the environment (and `.env` when present).
///
/// Business settings that admins change at runtime live in `system_completion_check_config`
/// instead; see [`crate::models::CompletionCheckConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub scheduler: SchedulerConfig,
    /// Canonical wall clock for the daily window. Storage is always UTC.
    pub timezone: FixedOffset,
    pub notify_webhook_url: Option<String>,
    /// Processes created for work-orders promoted from ERP staging.
    pub default_processes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL must be set")]
    MissingDatabaseUrl,
    #[error("{key} must be a valid {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("MES_HOST must parse to an IPv4 or IPv6 address, got '{0}'")]
    InvalidHost(String),
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so tests never touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let host = lookup("MES_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&lookup, "PORT", "u16", 8080u16)?;
        let log_level = lookup("MES_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let offset_minutes = parse_or(&lookup, "MES_TZ_OFFSET_MINUTES", "minute offset", 480i32)?;
        let timezone = FixedOffset::east_opt(offset_minutes * 60).ok_or(ConfigError::Invalid {
            key: "MES_TZ_OFFSET_MINUTES",
            expected: "offset within ±24h",
            value: offset_minutes.to_string(),
        })?;

        let tick_secs = parse_or(&lookup, "MES_SCHEDULER_TICK_SECS", "positive integer", 30u64)?;
        if tick_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "MES_SCHEDULER_TICK_SECS",
                expected: "positive integer",
                value: "0".into(),
            });
        }
        let scheduler_enabled = parse_or(&lookup, "MES_SCHEDULER_ENABLED", "bool", true)?;

        let notify_webhook_url = lookup("MES_NOTIFY_WEBHOOK_URL").filter(|v| !v.trim().is_empty());

        let default_processes = match lookup("MES_DEFAULT_PROCESSES") {
            Some(raw) => crate::models::permission::split_list(&raw),
            None => DEFAULT_PROCESSES.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Self {
            database_url,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            scheduler: SchedulerConfig {
                enabled: scheduler_enabled,
                tick_secs,
            },
            timezone,
            notify_webhook_url,
            default_processes,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, expected: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let cfg = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/mes")]))
            .expect("config loads");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.timezone.local_minus_utc(), 8 * 3600);
        assert_eq!(cfg.scheduler.tick_secs, 30);
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.default_processes, vec!["SMT", "assembly", "inspection"]);
        assert!(cfg.notify_webhook_url.is_none());
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));
    }

    #[test]
    fn invalid_port_is_reported_with_key() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/mes"),
            ("PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/mes"),
            ("MES_TZ_OFFSET_MINUTES", "0"),
            ("MES_SCHEDULER_ENABLED", "false"),
            ("MES_DEFAULT_PROCESSES", "SMT, DIP ,QC"),
            ("MES_HOST", "localhost"),
            ("PORT", "9000"),
        ]))
        .expect("config loads");
        assert_eq!(cfg.timezone.local_minus_utc(), 0);
        assert!(!cfg.scheduler.enabled);
        assert_eq!(cfg.default_processes, vec!["SMT", "DIP", "QC"]);
        assert_eq!(
            cfg.server.socket_addr().expect("addr").to_string(),
            "127.0.0.1:9000"
        );
    }
}
