// Configuration schema for the lineport relay.
// Numan Thabit 2026

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::wire::BROADCAST_MIN;

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
    /// Node identity, devices, and the hop budget.
    pub node: NodeSection,
    /// Relay timing knobs.
    pub timing: Timing,
    /// Serial port parameters shared by every device.
    pub serial: SerialSection,
}

impl Config {
    /// Loads configuration from `LINEPORT_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("LINEPORT_CONFIG") {
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

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.validate().map_err(ConfigError::Validation)?;
        self.timing.validate().map_err(ConfigError::Validation)?;
        self.serial.validate().map_err(ConfigError::Validation)?;
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

/// Node identity and attached devices.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// This node's service id; must be unicast (below `0xC0`).
    pub service: u8,
    /// Serial device paths to relay across.
    pub devices: Vec<String>,
    /// Hop budget: packets die once their ttd reaches this value.
    pub max_ttd: u8,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            service: 0x01,
            devices: Vec::new(),
            max_ttd: 5,
        }
    }
}

impl NodeSection {
    fn validate(&self) -> Result<(), String> {
        if self.service >= BROADCAST_MIN {
            return Err(format!(
                "node.service {:#04x} is a broadcast address; use an id below {:#04x}",
                self.service, BROADCAST_MIN
            ));
        }
        if self.max_ttd == 0 {
            return Err("node.max_ttd must be >= 1".into());
        }
        Ok(())
    }
}

/// Relay timing knobs, expressed in explicit units.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Keepalive cadence in seconds.
    pub keepalive_secs: u64,
    /// Routes live `max_ttd * lut_ttl_factor_secs` after their last refresh.
    pub lut_ttl_factor_secs: u64,
    /// Per-link frame pump budget per tick, in milliseconds.
    pub buffer_budget_ms: u64,
    /// Callback drain budget per tick, in milliseconds.
    pub callback_budget_ms: u64,
    /// Receive silence before a non-empty buffer may rot, in milliseconds.
    pub rot_rx_idle_ms: u64,
    /// Pop silence before a non-empty buffer may rot, in milliseconds.
    pub rot_pop_idle_ms: u64,
    /// Sleep between idle ticks in `serve_forever`, in milliseconds.
    pub poll_wait_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            keepalive_secs: 25,
            lut_ttl_factor_secs: 30,
            buffer_budget_ms: 1_000,
            callback_budget_ms: 2_000,
            rot_rx_idle_ms: 2_000,
            rot_pop_idle_ms: 4_000,
            poll_wait_ms: 200,
        }
    }
}

impl Timing {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Routing entries expire this long after their last refresh.
    pub fn lut_ttl(&self, max_ttd: u8) -> Duration {
        Duration::from_secs(self.lut_ttl_factor_secs.saturating_mul(max_ttd as u64))
    }

    pub fn buffer_budget(&self) -> Duration {
        Duration::from_millis(self.buffer_budget_ms)
    }

    pub fn callback_budget(&self) -> Duration {
        Duration::from_millis(self.callback_budget_ms)
    }

    pub fn rot_rx_idle(&self) -> Duration {
        Duration::from_millis(self.rot_rx_idle_ms)
    }

    pub fn rot_pop_idle(&self) -> Duration {
        Duration::from_millis(self.rot_pop_idle_ms)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.keepalive_secs == 0 {
            return Err("timing.keepalive_secs must be > 0".into());
        }
        if self.lut_ttl_factor_secs == 0 {
            return Err("timing.lut_ttl_factor_secs must be > 0".into());
        }
        if self.rot_rx_idle_ms == 0 || self.rot_pop_idle_ms == 0 {
            return Err("timing rot windows must be > 0".into());
        }
        Ok(())
    }
}

/// Serial port parameters applied to every device.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Baud rate for all LINE devices.
    pub baud_rate: u32,
    /// Upper bound on bytes pulled from a port per poll.
    pub read_chunk: usize,
    /// Port read timeout in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            baud_rate: 9_600,
            read_chunk: 64 * 1024,
            read_timeout_ms: 50,
        }
    }
}

impl SerialSection {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("serial.baud_rate must be > 0".into());
        }
        if self.read_chunk == 0 {
            return Err("serial.read_chunk must be > 0".into());
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
        assert_eq!(cfg.node.service, 0x01);
        assert_eq!(cfg.timing.keepalive_interval(), Duration::from_secs(25));
        assert_eq!(cfg.timing.lut_ttl(cfg.node.max_ttd), Duration::from_secs(150));
    }

    #[test]
    fn parses_a_full_file() {
        let input = r#"
            [node]
            service = 0x0A
            devices = ["/dev/ttyUSB0", "/dev/ttyUSB1"]
            max_ttd = 8

            [timing]
            keepalive_secs = 10
            poll_wait_ms = 100

            [serial]
            baud_rate = 115200
        "#;

        let cfg = Config::from_toml_str(input).unwrap();
        assert_eq!(cfg.node.service, 0x0A);
        assert_eq!(cfg.node.devices.len(), 2);
        assert_eq!(cfg.node.max_ttd, 8);
        assert_eq!(cfg.timing.keepalive_interval(), Duration::from_secs(10));
        assert_eq!(cfg.timing.lut_ttl(cfg.node.max_ttd), Duration::from_secs(240));
        // Unset fields keep their defaults.
        assert_eq!(cfg.timing.buffer_budget(), Duration::from_secs(1));
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.serial.read_chunk, 64 * 1024);
    }

    #[test]
    fn broadcast_service_id_rejected() {
        let input = r#"
            [node]
            service = 0xC5
        "#;

        let err = Config::from_toml_str(input).unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("broadcast")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn zero_hop_budget_rejected() {
        let input = r#"
            [node]
            max_ttd = 0
        "#;

        let err = Config::from_toml_str(input).unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("max_ttd")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn loads_from_a_reader() {
        let input: &[u8] = b"[node]\nservice = 7\n";
        let cfg = Config::from_reader(input).unwrap();
        assert_eq!(cfg.node.service, 7);
    }

    #[test]
    fn garbage_toml_is_a_parse_error() {
        let err = Config::from_toml_str("node = ]broken[").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
