use crate::build_info;
use crate::config::Config;
use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(
    about = "Indexes a sparse replica of a demo feed into a SQLite-backed sieve",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[clap(long)]
    /// SQLite file holding the sieve (overrides SIEVE_DB_PATH)
    pub db_path: Option<String>,

    #[clap(long)]
    /// Prefix for every store key the index writes (overrides SIEVE_KEY_PREFIX)
    pub key_prefix: Option<String>,

    #[clap(long)]
    /// Bits per persisted sieve chunk (overrides SIEVE_CHUNK_BITS)
    pub chunk_bits: Option<u64>,

    #[clap(long)]
    /// Serve /health and /metrics on this address (overrides METRICS_ADDR)
    pub metrics_addr: Option<SocketAddr>,

    #[clap(long, value_delimiter = ',', default_values_t = [0u64, 3, 4])]
    /// Blocks the sparse replica fetches from the origin
    pub fetch: Vec<u64>,

    #[clap(long)]
    /// Close the replica once the fetched blocks are indexed instead of waiting for a signal
    pub exit_when_done: bool,
}

impl Cli {
    /// Overlays explicitly passed flags onto `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(key_prefix) = &self.key_prefix {
            config.key_prefix = key_prefix.clone();
        }
        if let Some(chunk_bits) = self.chunk_bits {
            config.chunk_bits = chunk_bits;
        }
        if let Some(metrics_addr) = self.metrics_addr {
            config.metrics_addr = Some(metrics_addr);
        }
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use crate::build_info;
    use crate::config::Config;
    use clap::{error::ErrorKind, Parser};

    #[test]
    fn version_short_circuits_other_flags() {
        let err = Cli::try_parse_from(["feed-sieve", "--version", "--this-flag-does-not-exist"])
            .expect_err("expected clap to stop parsing after --version");

        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(build_info::VERSION_WITH_COMMIT));
    }

    #[test]
    fn fetch_list_defaults_to_demo_blocks() {
        let cli = Cli::try_parse_from(["feed-sieve"]).expect("no flags are required");
        assert_eq!(cli.fetch, vec![0, 3, 4]);
        assert!(!cli.exit_when_done);

        let cli = Cli::try_parse_from(["feed-sieve", "--fetch", "1,2"]).expect("valid list");
        assert_eq!(cli.fetch, vec![1, 2]);
    }

    #[test]
    fn flags_override_environment_config() {
        let mut config = Config::from_lookup(|name| match name {
            "SIEVE_DB_PATH" => Some("env.db".to_string()),
            "SIEVE_KEY_PREFIX" => Some("env/".to_string()),
            _ => None,
        })
        .expect("valid config");

        let cli = Cli::try_parse_from([
            "feed-sieve",
            "--db-path",
            "flag.db",
            "--chunk-bits",
            "64",
            "--metrics-addr",
            "127.0.0.1:9000",
        ])
        .expect("valid flags");
        cli.apply(&mut config);

        assert_eq!(config.db_path, "flag.db");
        assert_eq!(config.key_prefix, "env/");
        assert_eq!(config.chunk_bits, 64);
        assert_eq!(config.metrics_addr.map(|addr| addr.port()), Some(9000));
    }
}
