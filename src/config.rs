// Configuration schema for the dgramport channel.
// Numan Thabit 2025
use std::{
    env, fs,
    io::{self, Read},
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Per-channel tunables and socket options.
    pub channel: ChannelOptions,
    /// Event-loop staging parameters.
    pub batch: BatchOptions,
}

impl Config {
    /// Loads configuration from `DGRAMPORT_CONFIG` if set, otherwise returns
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("DGRAMPORT_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are
    /// violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate().map_err(ConfigError::Validation)?;
        self.batch.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Per-channel tunables and socket options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Cap on messages drained from the outbound queue per writability pass.
    pub max_messages_per_write: usize,
    /// Retries in the non-batched spin send path before giving up for the
    /// pass.
    pub write_spin_count: usize,
    /// Cap on datagrams handed to the pipeline per readability pass.
    pub max_messages_per_read: usize,
    /// Expected per-datagram payload size. Zero means one datagram per
    /// receive buffer and disables scattering reads.
    pub max_datagram_payload_size: usize,
    /// Enables the UDP_GRO socket option and GRO-aware receive handling.
    pub udp_gro: bool,
    /// Whether the channel counts as active as soon as it is registered.
    pub active_on_open: bool,
    /// Whether the channel re-arms reads after each pass without an explicit
    /// read request.
    pub auto_read: bool,
    /// Default interface for multicast group operations.
    pub network_interface: Option<IpAddr>,
    /// SO_REUSEADDR.
    pub reuse_address: Option<bool>,
    /// SO_BROADCAST.
    pub broadcast: Option<bool>,
    /// SO_RCVBUF in bytes.
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF in bytes.
    pub send_buffer_size: Option<usize>,
    /// IP_MULTICAST_TTL (IPv4 sockets).
    pub multicast_ttl: Option<u32>,
    /// IP_MULTICAST_LOOP / IPV6_MULTICAST_LOOP.
    pub multicast_loop: Option<bool>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_messages_per_write: 16,
            write_spin_count: 16,
            max_messages_per_read: 16,
            max_datagram_payload_size: 2048,
            udp_gro: false,
            active_on_open: true,
            auto_read: true,
            network_interface: None,
            reuse_address: None,
            broadcast: None,
            recv_buffer_size: None,
            send_buffer_size: None,
            multicast_ttl: None,
            multicast_loop: None,
        }
    }
}

impl ChannelOptions {
    /// Ensures invariants for the channel options hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_messages_per_write == 0 {
            return Err("max_messages_per_write must be > 0".into());
        }
        if self.write_spin_count == 0 {
            return Err("write_spin_count must be > 0".into());
        }
        if self.max_messages_per_read == 0 {
            return Err("max_messages_per_read must be > 0".into());
        }
        if self.recv_buffer_size == Some(0) || self.send_buffer_size == Some(0) {
            return Err("socket buffer sizes must be non-zero when set".into());
        }
        Ok(())
    }
}

/// Event-loop staging parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Slot count of the per-registration packet staging array.
    pub packet_array_capacity: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            packet_array_capacity: 64,
        }
    }
}

impl BatchOptions {
    /// Ensures invariants for the staging parameters hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.packet_array_capacity == 0 || self.packet_array_capacity > 1024 {
            return Err("packet_array_capacity must lie within [1, 1024]".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_spin_count_rejected() {
        let input = r#"
            [channel]
            write_spin_count = 0
        "#;

        let err = Config::from_toml_str(input).unwrap_err();
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("write_spin_count"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_packet_array_rejected() {
        let input = r#"
            [batch]
            packet_array_capacity = 4096
        "#;

        let err = Config::from_toml_str(input).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn channel_options_parse_from_toml() {
        let input = r#"
            [channel]
            max_datagram_payload_size = 1472
            udp_gro = true
            network_interface = "192.0.2.1"

            [batch]
            packet_array_capacity = 32
        "#;

        let cfg = Config::from_toml_str(input).unwrap();
        assert_eq!(cfg.channel.max_datagram_payload_size, 1472);
        assert!(cfg.channel.udp_gro);
        assert_eq!(
            cfg.channel.network_interface,
            Some("192.0.2.1".parse().unwrap())
        );
        assert_eq!(cfg.batch.packet_array_capacity, 32);
    }

    #[test]
    fn zero_payload_size_means_single_datagram_mode() {
        let input = r#"
            [channel]
            max_datagram_payload_size = 0
        "#;
        let cfg = Config::from_toml_str(input).unwrap();
        assert_eq!(cfg.channel.max_datagram_payload_size, 0);
    }
}
