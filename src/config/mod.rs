//! Configuration management for blockrelay-node
//!
//! Handles loading and defaulting the tunables that govern block-propagation
//! behaviour: in-flight limits, announcement caps, thin-block
//! parallelism, ban policy, and stalling detection.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Cap on simultaneous block downloads from a single peer.
pub const DEFAULT_MAX_BLOCKS_IN_TRANSIT_PER_PEER: u32 = 16;
/// Width of the rolling window of headers eligible for parallel download.
pub const DEFAULT_BLOCK_DOWNLOAD_WINDOW: u32 = 1024;
/// Cap on headers returned by a single `getheaders` reply.
pub const DEFAULT_MAX_HEADERS_RESULTS: u32 = 2000;
/// Cap on block hashes announced to a peer in one pass.
pub const DEFAULT_MAX_BLOCKS_TO_ANNOUNCE: u32 = 8;
/// Thin-block parallelism default.
pub const DEFAULT_THIN_PARALLEL_MAX: u32 = 3;
/// 2 MiB. `tcp_transport` enforces its own wire-frame ceiling independently;
/// this is the relay-level default.
pub const DEFAULT_MAX_PROTOCOL_MESSAGE_LENGTH: usize = 2 * 1024 * 1024;
/// Misbehavior score at which a peer is disconnected and banned.
pub const DEFAULT_BAN_THRESHOLD: i32 = 100;
/// Default ban duration.
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
/// Default stall timeout for a single queued block request.
pub const DEFAULT_STALLING_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the block-propagation core and its listening transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Network listening address.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Maximum number of simultaneously connected peers.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// `MAX_BLOCKS_IN_TRANSIT_PER_PEER`.
    #[serde(default = "default_max_blocks_in_transit_per_peer")]
    pub max_blocks_in_transit_per_peer: u32,

    /// `BLOCK_DOWNLOAD_WINDOW`.
    #[serde(default = "default_block_download_window")]
    pub block_download_window: u32,

    /// `MAX_HEADERS_RESULTS`.
    #[serde(default = "default_max_headers_results")]
    pub max_headers_results: u32,

    /// `MAX_BLOCKS_TO_ANNOUNCE`.
    #[serde(default = "default_max_blocks_to_announce")]
    pub max_blocks_to_announce: u32,

    /// Maximum number of peers concurrently thin-fetching the same block.
    #[serde(default = "default_thin_parallel_max")]
    pub thin_parallel_max: u32,

    /// `MAX_PROTOCOL_MESSAGE_LENGTH`.
    #[serde(default = "default_max_protocol_message_length")]
    pub max_protocol_message_length: usize,

    /// Misbehavior score at which a peer is disconnected and banned.
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: i32,

    /// How long a ban is held once triggered (default 24h).
    #[serde(with = "humantime_duration", default = "default_ban_duration")]
    pub ban_duration: Duration,

    /// `BLOCK_STALLING_TIMEOUT`.
    #[serde(with = "humantime_duration", default = "default_stalling_timeout")]
    pub stalling_timeout: Duration,

    /// Tracing filter/format settings, split out so `utils::logging` can be
    /// wired up without the rest of `RelayConfig` knowing about it.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_peers: default_max_peers(),
            max_blocks_in_transit_per_peer: default_max_blocks_in_transit_per_peer(),
            block_download_window: default_block_download_window(),
            max_headers_results: default_max_headers_results(),
            max_blocks_to_announce: default_max_blocks_to_announce(),
            thin_parallel_max: default_thin_parallel_max(),
            max_protocol_message_length: default_max_protocol_message_length(),
            ban_threshold: default_ban_threshold(),
            ban_duration: default_ban_duration(),
            stalling_timeout: default_stalling_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Tracing setup, handed to `utils::logging::init_logging_from_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` spec, e.g. `"info"` or `"blockrelay_node=debug,network=trace"`.
    /// `RUST_LOG` always takes precedence over this.
    #[serde(default)]
    pub filter: Option<String>,
    /// Emit JSON-formatted log lines instead of the human-readable default.
    #[serde(default)]
    pub json_format: bool,
}

impl RelayConfig {
    /// Load from a TOML file, falling back to field defaults for anything
    /// the file omits.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_max_peers() -> usize {
    125
}

fn default_max_blocks_in_transit_per_peer() -> u32 {
    DEFAULT_MAX_BLOCKS_IN_TRANSIT_PER_PEER
}

fn default_block_download_window() -> u32 {
    DEFAULT_BLOCK_DOWNLOAD_WINDOW
}

fn default_max_headers_results() -> u32 {
    DEFAULT_MAX_HEADERS_RESULTS
}

fn default_max_blocks_to_announce() -> u32 {
    DEFAULT_MAX_BLOCKS_TO_ANNOUNCE
}

fn default_thin_parallel_max() -> u32 {
    DEFAULT_THIN_PARALLEL_MAX
}

fn default_max_protocol_message_length() -> usize {
    DEFAULT_MAX_PROTOCOL_MESSAGE_LENGTH
}

fn default_ban_threshold() -> i32 {
    DEFAULT_BAN_THRESHOLD
}

fn default_ban_duration() -> Duration {
    DEFAULT_BAN_DURATION
}

fn default_stalling_timeout() -> Duration {
    DEFAULT_STALLING_TIMEOUT
}

/// `Duration` as whole seconds on the wire, since `toml`/`serde` have no
/// native duration support.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_tunables() {
        let config = RelayConfig::default();
        assert_eq!(config.max_blocks_in_transit_per_peer, 16);
        assert_eq!(config.block_download_window, 1024);
        assert_eq!(config.max_headers_results, 2000);
        assert_eq!(config.max_blocks_to_announce, 8);
        assert_eq!(config.thin_parallel_max, 3);
        assert_eq!(config.stalling_timeout, Duration::from_secs(2));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = RelayConfig::from_toml_str("max_peers = 50\n").unwrap();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.max_blocks_to_announce, 8);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RelayConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = RelayConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.max_peers, config.max_peers);
        assert_eq!(parsed.ban_threshold, config.ban_threshold);
    }
}
