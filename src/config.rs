//! # Configuration Management
//!
//! Centralized configuration for links, listeners, pools and chunked transfers.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`LINKWIRE_*`)
//!
//! ## Wire constants
//! The frame layout is fixed: `[magic(4)][type_code(4)][length(4)][payload]`,
//! all integers little-endian.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Magic bytes that open every frame ("LWK1")
pub const MAGIC_BYTES: [u8; 4] = [0x4C, 0x57, 0x4B, 0x31];

/// Size of the frame header: magic, type code and payload length
pub const HEADER_LEN: usize = MAGIC_BYTES.len() + 4 + 4;

/// Max allowed frame payload (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default transfer chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1_048_576;

/// Largest UDP payload that fits in one IPv4 datagram
pub const MAX_UDP_DATAGRAM: usize = 65_507;

/// Default upper bound on the size of a received file
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default upper bound on the chunk count of a received file
pub const DEFAULT_MAX_CHUNK_COUNT: u32 = 1 << 20;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Per-connection framing and heartbeat settings
    #[serde(default)]
    pub linker: LinkerConfig,

    /// Dialing side settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Listening side settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Buffer pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Chunked transfer settings
    #[serde(default)]
    pub splitter: SplitterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LINKWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Some(val) = env_parse::<u64>("LINKWIRE_CONNECTION_TIMEOUT_MS")? {
            config.client.connection_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("LINKWIRE_HEARTBEAT_INTERVAL_MS")? {
            config.linker.heartbeat_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<bool>("LINKWIRE_NEED_HEARTBEAT")? {
            config.linker.need_heartbeat = val;
        }

        if let Some(val) = env_parse::<usize>("LINKWIRE_CHUNK_SIZE")? {
            config.splitter.chunk_size = val;
        }

        if let Some(val) = env_parse::<u64>("LINKWIRE_MAX_TRANSFER_SIZE")? {
            config.splitter.max_transfer_size = val;
        }

        if let Some(val) = env_parse::<usize>("LINKWIRE_POOL_MAX_RETAINED")? {
            config.pool.max_retained = val;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.linker.validate());
        errors.extend(self.client.validate());
        errors.extend(self.server.validate());
        errors.extend(self.pool.validate());
        errors.extend(self.splitter.validate(self.linker.max_frame_size));
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Framing and liveness settings applied to every linker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkerConfig {
    /// Largest payload a frame may declare before the stream is considered corrupt
    pub max_frame_size: usize,

    /// Request periodic keep-alive frames when the connection is negotiated
    pub need_heartbeat: bool,

    /// Interval between heartbeat frames
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which a heartbeating connection is considered dead
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// Frames that may wait in the outbound queue before senders back off
    pub send_queue_depth: usize,

    /// Largest datagram a UDP linker will emit
    pub udp_max_datagram: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            need_heartbeat: false,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            heartbeat_timeout: timeout::KEEPALIVE_INTERVAL * 3,
            send_queue_depth: 64,
            udp_max_datagram: MAX_UDP_DATAGRAM,
        }
    }
}

impl LinkerConfig {
    /// Validate linker configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > i32::MAX as usize {
            errors.push(format!(
                "Max frame size too large: {} bytes (length field is a signed 32-bit integer)",
                self.max_frame_size
            ));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            errors.push("Heartbeat timeout must be longer than the heartbeat interval".to_string());
        }

        if self.send_queue_depth == 0 {
            errors.push("Send queue depth must be greater than 0".to_string());
        }

        if self.udp_max_datagram == 0 || self.udp_max_datagram > MAX_UDP_DATAGRAM {
            errors.push(format!(
                "UDP datagram limit must be within 1..={MAX_UDP_DATAGRAM}"
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Whether to automatically reconnect on connection loss
    pub auto_reconnect: bool,

    /// Maximum number of reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            auto_reconnect: false,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.auto_reconnect && self.max_reconnect_attempts == 0 {
            errors.push(
                "Max reconnect attempts must be greater than 0 when auto_reconnect is enabled"
                    .to_string(),
            );
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:9400")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9400"),
            max_connections: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9400')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Released buffers kept for reuse; extras are dropped
    pub max_retained: usize,

    /// Capacity of a freshly created buffer
    pub initial_buffer_capacity: usize,

    /// Buffers that grew past this are not returned to the pool
    pub max_buffer_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
            initial_buffer_capacity: 4096,
            max_buffer_capacity: 4 * DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Twice the available parallelism, falling back to 2 when it cannot be queried.
pub fn default_max_retained() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

impl PoolConfig {
    /// Validate pool configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.initial_buffer_capacity == 0 {
            errors.push("Initial buffer capacity must be greater than 0".to_string());
        }

        if self.max_buffer_capacity < self.initial_buffer_capacity {
            errors.push(
                "Max buffer capacity cannot be smaller than the initial capacity".to_string(),
            );
        }

        errors
    }
}

/// Chunked transfer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SplitterConfig {
    /// Bytes per chunk
    pub chunk_size: usize,

    /// Inactivity after which a partially received transfer is abandoned
    #[serde(with = "duration_serde")]
    pub receive_timeout: Duration,

    /// How long a caller waits for a busy resource before giving up
    #[serde(with = "duration_serde")]
    pub busy_wait_timeout: Duration,

    /// Largest file a peer may announce
    #[serde(default = "default_max_transfer_size")]
    pub max_transfer_size: u64,

    /// Most chunks a peer may announce for one file
    #[serde(default = "default_max_chunk_count")]
    pub max_chunk_count: u32,
}

fn default_max_transfer_size() -> u64 {
    DEFAULT_MAX_TRANSFER_SIZE
}

fn default_max_chunk_count() -> u32 {
    DEFAULT_MAX_CHUNK_COUNT
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            receive_timeout: Duration::from_secs(30),
            busy_wait_timeout: timeout::DEFAULT_TIMEOUT,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
        }
    }
}

impl SplitterConfig {
    /// Validate splitter configuration against the frame limit
    pub fn validate(&self, max_frame_size: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if self.chunk_size == 0 {
            errors.push("Chunk size must be greater than 0".to_string());
        } else if self.chunk_size > i32::MAX as usize {
            errors.push("Chunk size does not fit the 32-bit length field".to_string());
        } else if self.chunk_size + 64 > max_frame_size {
            errors.push(format!(
                "Chunk size {} does not fit in a frame of at most {} bytes",
                self.chunk_size, max_frame_size
            ));
        }

        if self.receive_timeout.as_millis() < 100 {
            errors.push("Receive timeout too short (minimum: 100ms)".to_string());
        }

        if self.max_transfer_size > i64::MAX as u64 {
            errors.push("Max transfer size does not fit the 64-bit length field".to_string());
        }

        if self.max_chunk_count == 0 {
            errors.push("Max chunk count must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("linkwire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
