use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both ROOMBOOK_TLS_CERT and ROOMBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Compact once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "roombook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            tls: None,
        }
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

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_connections =
            parsed(&lookup, "ROOMBOOK_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Zero("ROOMBOOK_MAX_CONNECTIONS"));
        }
        let interval_secs: u64 = parsed(&lookup, "ROOMBOOK_COMPACT_INTERVAL_SECS")?
            .unwrap_or(defaults.compact_interval.as_secs());
        if interval_secs == 0 {
            return Err(ConfigError::Zero("ROOMBOOK_COMPACT_INTERVAL_SECS"));
        }

        let tls = match (lookup("ROOMBOOK_TLS_CERT"), lookup("ROOMBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            bind: lookup("ROOMBOOK_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "ROOMBOOK_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("ROOMBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("ROOMBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed(&lookup, "ROOMBOOK_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            compact_interval: Duration::from_secs(interval_secs),
            metrics_port: parsed(&lookup, "ROOMBOOK_METRICS_PORT")?,
            tls,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/roombook.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_vars(&[
            ("ROOMBOOK_PORT", "6543"),
            ("ROOMBOOK_BIND", "127.0.0.1"),
            ("ROOMBOOK_MAX_CONNECTIONS", "8"),
            ("ROOMBOOK_COMPACT_INTERVAL_SECS", "5"),
            ("ROOMBOOK_METRICS_PORT", " 9100 "),
            ("ROOMBOOK_TLS_CERT", "/etc/cert.pem"),
            ("ROOMBOOK_TLS_KEY", "/etc/key.pem"),
        ])
        .unwrap();
        assert_eq!(config.port, 6543);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_interval, Duration::from_secs(5));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.tls.unwrap().key, PathBuf::from("/etc/key.pem"));
    }

    #[test]
    fn bad_values_are_errors_not_defaults() {
        assert_eq!(
            from_vars(&[("ROOMBOOK_PORT", "eighty")]),
            Err(ConfigError::Invalid {
                var: "ROOMBOOK_PORT",
                value: "eighty".into()
            })
        );
        assert!(matches!(
            from_vars(&[("ROOMBOOK_COMPACT_THRESHOLD", "-1")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(
            from_vars(&[("ROOMBOOK_MAX_CONNECTIONS", "0")]),
            Err(ConfigError::Zero("ROOMBOOK_MAX_CONNECTIONS"))
        );
    }

    #[test]
    fn tls_needs_both_paths() {
        assert_eq!(
            from_vars(&[("ROOMBOOK_TLS_CERT", "/etc/cert.pem")]),
            Err(ConfigError::PartialTls)
        );
    }
}
