//! Command-line surface for the `blockrelay-node` binary.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Block-propagation relay: header sync, compact/xthin block reconstruction,
/// and re-announcement over a pluggable chain view.
#[derive(Parser, Debug)]
#[command(name = "blockrelay-node", version, about)]
pub struct Cli {
    /// Path to a TOML config file. Missing fields fall back to defaults.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Overrides `listen_addr` from the config file.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Overrides the config file's logging filter (RUST_LOG still wins).
    #[arg(long, value_name = "FILTER")]
    pub log_filter: Option<String>,
}

impl Cli {
    /// Loads the `RelayConfig` named by `--config`, if any, and layers the
    /// `--listen`/`--log-filter` overrides on top.
    pub fn load_config(&self) -> anyhow::Result<crate::config::RelayConfig> {
        let mut config = match &self.config {
            Some(path) => crate::config::RelayConfig::load_from_file(path)?,
            None => crate::config::RelayConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = Some(listen);
        }
        if let Some(filter) = &self.log_filter {
            config.logging.filter = Some(filter.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_listen_override() {
        let cli = Cli::parse_from(["blockrelay-node", "--listen", "127.0.0.1:8333"]);
        assert_eq!(cli.listen, Some("127.0.0.1:8333".parse().unwrap()));
    }
}
