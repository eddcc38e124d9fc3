use std::path::PathBuf;
use std::str::FromStr;

use crate::time::{BusinessZone, DEFAULT_TIMEZONE, TimeError};

/// Server configuration, read once from `BARBERCAL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub zone: BusinessZone,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Zone(TimeError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::Zone(e) => write!(f, "BARBERCAL_TIMEZONE: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// set-but-malformed keys are errors rather than silently defaulted.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let zone_name = lookup("BARBERCAL_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.into());
        Ok(Self {
            bind: lookup("BARBERCAL_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "BARBERCAL_PORT")?.unwrap_or(5433),
            data_dir: PathBuf::from(lookup("BARBERCAL_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("BARBERCAL_PASSWORD").unwrap_or_else(|| "barbercal".into()),
            max_connections: parsed(&lookup, "BARBERCAL_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "BARBERCAL_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "BARBERCAL_METRICS_PORT")?,
            zone: BusinessZone::from_name(&zone_name).map_err(ConfigError::Zone)?,
            tls_cert: lookup("BARBERCAL_TLS_CERT"),
            tls_key: lookup("BARBERCAL_TLS_KEY"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("barbercal.wal")
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
