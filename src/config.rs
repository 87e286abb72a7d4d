//! Process configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Cleartext password accepted for every pgwire login.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before a tenant's log is compacted.
    pub compact_threshold: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub automation_enabled: bool,
    pub automation_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            automation_enabled: true,
            automation_interval: Duration::from_millis(60_000),
        }
    }
}

fn parse<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
        value,
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset or empty variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut cfg = Config::default();

        if let Some(v) = get("SLOTD_PORT") {
            cfg.port = parse("SLOTD_PORT", v)?;
        }
        if let Some(v) = get("SLOTD_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = get("SLOTD_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLOTD_PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = get("SLOTD_MAX_CONNECTIONS") {
            cfg.max_connections = parse("SLOTD_MAX_CONNECTIONS", v)?;
            if cfg.max_connections == 0 {
                return Err(ConfigError::Invalid {
                    name: "SLOTD_MAX_CONNECTIONS",
                    value: "0".into(),
                    reason: "must be at least 1".into(),
                });
            }
        }
        if let Some(v) = get("SLOTD_COMPACT_THRESHOLD") {
            cfg.compact_threshold = parse("SLOTD_COMPACT_THRESHOLD", v)?;
        }
        if let Some(v) = get("SLOTD_METRICS_PORT") {
            cfg.metrics_port = Some(parse("SLOTD_METRICS_PORT", v)?);
        }
        cfg.tls_cert = get("SLOTD_TLS_CERT").map(PathBuf::from);
        cfg.tls_key = get("SLOTD_TLS_KEY").map(PathBuf::from);

        // Only an explicit "false" turns automation off.
        if let Some(v) = lookup("AUTOMATION_ENABLED") {
            cfg.automation_enabled = !v.trim().eq_ignore_ascii_case("false");
        }
        if let Some(v) = get("AUTOMATION_INTERVAL_MS") {
            let ms: u64 = parse("AUTOMATION_INTERVAL_MS", v)?;
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    name: "AUTOMATION_INTERVAL_MS",
                    value: "0".into(),
                    reason: "must be positive".into(),
                });
            }
            cfg.automation_interval = Duration::from_millis(ms);
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
