//! Environment-driven server settings.

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    pub redis_url: String,
    /// In-process groups when unset.
    pub nats_url: Option<String>,
    pub nats_subject_prefix: String,
    pub room_namespace: String,
    pub lock_timeout: Duration,
    pub lock_lease: Duration,
    pub jwt_secret: Option<String>,
    pub identity_cache_ttl: Duration,
}

/// Reads settings from the process environment.
pub fn load_config() -> Result<ServerSettings, ConfigError> {
    ServerSettings::from_vars(|name| env::var(name).ok())
}

impl ServerSettings {
    /// Builds settings from any variable source.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tls_cert_path = var("TLS_CERT_PATH");
        Ok(ServerSettings {
            port: parse(&var, "PORT", 8080)?,
            tls_enabled: tls_cert_path.is_some(),
            tls_cert_path: tls_cert_path.unwrap_or_else(|| "./fullchain.pem".to_string()),
            tls_key_path: var("TLS_KEY_PATH").unwrap_or_else(|| "./privkey.pem".to_string()),
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            nats_url: var("NATS_URL").filter(|url| !url.is_empty()),
            nats_subject_prefix: var("NATS_SUBJECT_PREFIX")
                .unwrap_or_else(|| "signaling.groups".to_string()),
            room_namespace: var("ROOM_NAMESPACE").unwrap_or_else(|| "v3".to_string()),
            lock_timeout: Duration::from_millis(parse(&var, "LOCK_TIMEOUT_MS", 5000)?),
            lock_lease: Duration::from_millis(parse(&var, "LOCK_LEASE_MS", 30_000)?),
            jwt_secret: var("JWT_SECRET").filter(|secret| !secret.is_empty()),
            identity_cache_ttl: Duration::from_secs(parse(&var, "IDENTITY_CACHE_TTL_SECS", 600)?),
        })
    }
}

fn parse<F, T>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}
