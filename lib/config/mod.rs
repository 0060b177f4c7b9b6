use std::env;
use std::net::SocketAddr;

use thiserror::Error;

use crate::index::DEFAULT_CHUNK_BITS;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

pub struct Config {
    /// SQLite file holding the sieve. `SIEVE_DB_PATH`, defaults to `feed-sieve.sqlite3`.
    pub db_path: String,
    /// Namespace for every key the index writes. `SIEVE_KEY_PREFIX`, defaults to empty.
    pub key_prefix: String,
    /// Bits per persisted sieve chunk. `SIEVE_CHUNK_BITS`.
    pub chunk_bits: u64,
    /// Where `/health` and `/metrics` are served. `METRICS_ADDR`; unset disables the server.
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = lookup("SIEVE_DB_PATH").unwrap_or_else(|| "feed-sieve.sqlite3".to_string());
        let key_prefix = lookup("SIEVE_KEY_PREFIX").unwrap_or_default();

        let chunk_bits = match lookup("SIEVE_CHUNK_BITS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "SIEVE_CHUNK_BITS",
                    expected: "an unsigned integer",
                    value: raw.clone(),
                })?,
            None => DEFAULT_CHUNK_BITS,
        };

        let metrics_addr = match lookup("METRICS_ADDR") {
            Some(raw) if !raw.trim().is_empty() => {
                Some(raw.trim().parse::<SocketAddr>().map_err(|_| {
                    ConfigError::InvalidValue {
                        name: "METRICS_ADDR",
                        expected: "a socket address such as 0.0.0.0:3000",
                        value: raw.clone(),
                    }
                })?)
            }
            _ => None,
        };

        Ok(Self {
            db_path,
            key_prefix,
            chunk_bits,
            metrics_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError};
    use crate::index::DEFAULT_CHUNK_BITS;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).expect("defaults are valid");

        assert_eq!(config.db_path, "feed-sieve.sqlite3");
        assert_eq!(config.key_prefix, "");
        assert_eq!(config.chunk_bits, DEFAULT_CHUNK_BITS);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn values_are_read_from_source() {
        let config = Config::from_lookup(lookup(&[
            ("SIEVE_DB_PATH", "/tmp/sieve.db"),
            ("SIEVE_KEY_PREFIX", "replica/"),
            ("SIEVE_CHUNK_BITS", "1024"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
        ]))
        .expect("valid config");

        assert_eq!(config.db_path, "/tmp/sieve.db");
        assert_eq!(config.key_prefix, "replica/");
        assert_eq!(config.chunk_bits, 1024);
        assert_eq!(
            config.metrics_addr.map(|addr| addr.port()),
            Some(9100)
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = Config::from_lookup(lookup(&[("SIEVE_CHUNK_BITS", "lots")]))
            .err()
            .expect("chunk bits must parse");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "SIEVE_CHUNK_BITS",
                ..
            }
        ));

        let err = Config::from_lookup(lookup(&[("METRICS_ADDR", "localhost")]))
            .err()
            .expect("addr must parse");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "METRICS_ADDR",
                ..
            }
        ));
    }
}
