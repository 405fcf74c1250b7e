//! Transport configuration.
//!
//! Options are resolved in three layers: built-in defaults, then an optional
//! YAML file named by `RNTBD_CONFIG`, then `RNTBD_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A hung receive is only reported once the last send is this old.
pub const RECEIVE_HANG_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// A hung send is only reported once the last send attempt is this old.
pub const SEND_HANG_GRACE_PERIOD: Duration = Duration::from_secs(2);

pub const MIN_RECEIVE_HANG_DETECTION_SECS: u64 = 20;
pub const MIN_SEND_HANG_DETECTION_SECS: u64 = 5;
pub const MAX_PARTITION_COUNT: usize = 8;

/// How outbound connections pick their local port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReuseMode {
    /// Let the OS assign an ephemeral port.
    #[default]
    ReuseUnicastPort,
    /// Bind to ports recycled through the user port pool.
    PrivatePortPool,
}

impl std::str::FromStr for PortReuseMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "reuse_unicast_port" | "reuseunicastport" => Ok(PortReuseMode::ReuseUnicastPort),
            "private_port_pool" | "privateportpool" => Ok(PortReuseMode::PrivatePortPool),
            _ => Err(ConfigError::ValidationError(format!(
                "unknown port reuse mode '{}'",
                s
            ))),
        }
    }
}

/// TLS settings for replica connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// PEM bundle of trusted roots. The webpki roots are used when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// Skip certificate verification. Testing only.
    pub insecure: bool,
    /// Overrides the SNI host name sent during the handshake.
    pub server_name: Option<String>,
}

impl TlsOptions {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("RNTBD_TLS_ENABLED") {
            self.enabled = parse_flag(&v);
        }
        if let Some(path) = var("RNTBD_TLS_CA_CERT") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(v) = var("RNTBD_TLS_INSECURE") {
            self.insecure = parse_flag(&v);
        }
        if let Some(name) = var("RNTBD_TLS_SERVER_NAME") {
            if !name.is_empty() {
                self.server_name = Some(name);
            }
        }
    }
}

/// Transport client options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub request_timeout_secs: u64,
    pub open_timeout_secs: u64,
    /// Channels per server endpoint, across all its partitions.
    pub max_channels: usize,
    /// Independent load-balancing partitions per endpoint.
    pub partition_count: usize,
    pub max_requests_per_channel: usize,
    pub receive_hang_detection_secs: u64,
    pub send_hang_detection_secs: u64,
    /// 0 disables idle detection.
    pub idle_timeout_secs: u64,
    pub port_reuse_mode: PortReuseMode,
    /// Distinct usable ports the pool must know before it hands out candidates.
    pub port_pool_reuse_threshold: usize,
    /// Candidate ports tried per connection before falling back to the OS.
    pub port_pool_bind_attempts: usize,
    pub user_agent: String,
    pub client_version: String,
    pub tls: TlsOptions,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            open_timeout_secs: 5,
            max_channels: 65535,
            partition_count: 1,
            max_requests_per_channel: 30,
            receive_hang_detection_secs: 65,
            send_hang_detection_secs: 10,
            idle_timeout_secs: 0,
            port_reuse_mode: PortReuseMode::default(),
            port_pool_reuse_threshold: 256,
            port_pool_bind_attempts: 5,
            user_agent: format!("rntbd-client/{}", env!("CARGO_PKG_VERSION")),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            tls: TlsOptions::default(),
        }
    }
}

impl TransportOptions {
    /// Loads options from defaults, the `RNTBD_CONFIG` file, and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Ok(path) = std::env::var("RNTBD_CONFIG") {
            options = Self::from_file(&path)?;
        }

        options.apply_env_overrides();
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.apply_env_overrides();
        options
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        override_parsed(var, "RNTBD_REQUEST_TIMEOUT", &mut self.request_timeout_secs);
        override_parsed(var, "RNTBD_OPEN_TIMEOUT", &mut self.open_timeout_secs);
        override_parsed(var, "RNTBD_MAX_CHANNELS", &mut self.max_channels);
        override_parsed(var, "RNTBD_PARTITION_COUNT", &mut self.partition_count);
        override_parsed(
            var,
            "RNTBD_MAX_REQUESTS_PER_CHANNEL",
            &mut self.max_requests_per_channel,
        );
        override_parsed(
            var,
            "RNTBD_RECEIVE_HANG_DETECTION",
            &mut self.receive_hang_detection_secs,
        );
        override_parsed(
            var,
            "RNTBD_SEND_HANG_DETECTION",
            &mut self.send_hang_detection_secs,
        );
        override_parsed(var, "RNTBD_IDLE_TIMEOUT", &mut self.idle_timeout_secs);
        override_parsed(var, "RNTBD_PORT_REUSE_MODE", &mut self.port_reuse_mode);
        override_parsed(
            var,
            "RNTBD_PORT_POOL_REUSE_THRESHOLD",
            &mut self.port_pool_reuse_threshold,
        );
        override_parsed(
            var,
            "RNTBD_PORT_POOL_BIND_ATTEMPTS",
            &mut self.port_pool_bind_attempts,
        );

        if let Some(agent) = var("RNTBD_USER_AGENT") {
            if !agent.is_empty() {
                self.user_agent = agent;
            }
        }

        self.tls.apply_overrides(var);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be at least 1"));
        }
        if self.open_timeout_secs == 0 {
            return Err(invalid("open_timeout_secs must be at least 1"));
        }
        if self.max_channels == 0 {
            return Err(invalid("max_channels must be at least 1"));
        }
        if !(1..=MAX_PARTITION_COUNT).contains(&self.partition_count) {
            return Err(ConfigError::ValidationError(format!(
                "partition_count must be between 1 and {}, got {}",
                MAX_PARTITION_COUNT, self.partition_count
            )));
        }
        if self.max_requests_per_channel == 0 {
            return Err(invalid("max_requests_per_channel must be at least 1"));
        }
        if self.receive_hang_detection_secs < MIN_RECEIVE_HANG_DETECTION_SECS {
            return Err(ConfigError::ValidationError(format!(
                "receive_hang_detection_secs must be at least {}",
                MIN_RECEIVE_HANG_DETECTION_SECS
            )));
        }
        if self.send_hang_detection_secs < MIN_SEND_HANG_DETECTION_SECS {
            return Err(ConfigError::ValidationError(format!(
                "send_hang_detection_secs must be at least {}",
                MIN_SEND_HANG_DETECTION_SECS
            )));
        }
        if self.port_reuse_mode == PortReuseMode::PrivatePortPool
            && self.port_pool_bind_attempts == 0
        {
            return Err(invalid("port_pool_bind_attempts must be at least 1"));
        }
        if self.user_agent.is_empty() {
            return Err(invalid("user_agent must not be empty"));
        }
        if self.tls.server_name.as_deref() == Some("") {
            return Err(invalid("tls.server_name must not be empty when set"));
        }
        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_max_requests_per_channel(mut self, max: usize) -> Self {
        self.max_requests_per_channel = max;
        self
    }

    pub fn with_port_reuse_mode(mut self, mode: PortReuseMode) -> Self {
        self.port_reuse_mode = mode;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn receive_hang_detection(&self) -> Duration {
        Duration::from_secs(self.receive_hang_detection_secs)
    }

    pub fn send_hang_detection(&self) -> Duration {
        Duration::from_secs(self.send_hang_detection_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Channels each partition may open. The last partitions may round up.
    pub fn max_channels_per_partition(&self) -> usize {
        let partitions = self.partition_count.max(1);
        self.max_channels.div_ceil(partitions)
    }
}

fn override_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(value) = var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_options() {
        let options = TransportOptions::default();
        assert_eq!(options.request_timeout(), Duration::from_secs(10));
        assert_eq!(options.open_timeout(), Duration::from_secs(5));
        assert_eq!(options.max_channels, 65535);
        assert_eq!(options.partition_count, 1);
        assert_eq!(options.max_requests_per_channel, 30);
        assert_eq!(options.idle_timeout(), None);
        assert_eq!(options.port_reuse_mode, PortReuseMode::ReuseUnicastPort);
        assert!(options.user_agent.starts_with("rntbd-client/"));
        assert!(!options.tls.enabled);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let options = TransportOptions::default()
            .with_request_timeout(Duration::from_secs(3))
            .with_partition_count(4)
            .with_port_reuse_mode(PortReuseMode::PrivatePortPool);
        let yaml = serde_yaml::to_string(&options).unwrap();
        assert!(yaml.contains("private_port_pool"));

        let parsed: TransportOptions = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.request_timeout_secs, 3);
        assert_eq!(parsed.partition_count, 4);
        assert_eq!(parsed.port_reuse_mode, PortReuseMode::PrivatePortPool);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_requests_per_channel: 8").unwrap();
        writeln!(file, "tls:").unwrap();
        writeln!(file, "  enabled: true").unwrap();
        writeln!(file, "  server_name: replica.internal").unwrap();

        let options = TransportOptions::from_file(file.path()).unwrap();
        assert_eq!(options.max_requests_per_channel, 8);
        assert_eq!(options.request_timeout_secs, 10);
        assert!(options.tls.enabled);
        assert_eq!(options.tls.server_name.as_deref(), Some("replica.internal"));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let missing = TransportOptions::from_file("/nonexistent/rntbd.yaml");
        assert!(matches!(missing, Err(ConfigError::IoError(..))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "request_timeout_secs: [1, 2]").unwrap();
        let malformed = TransportOptions::from_file(file.path());
        assert!(matches!(malformed, Err(ConfigError::ParseError(..))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rntbd.yaml");
        let options = TransportOptions::default().with_max_channels(12);
        options.save(&path).unwrap();
        assert_eq!(TransportOptions::from_file(&path).unwrap().max_channels, 12);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RNTBD_REQUEST_TIMEOUT", "2"),
            ("RNTBD_PARTITION_COUNT", "3"),
            ("RNTBD_PORT_REUSE_MODE", "PrivatePortPool"),
            ("RNTBD_MAX_CHANNELS", "not-a-number"),
            ("RNTBD_TLS_ENABLED", "true"),
            ("RNTBD_TLS_SERVER_NAME", "sni.example"),
            ("RNTBD_USER_AGENT", "probe/1.0"),
        ]
        .into_iter()
        .collect();

        let mut options = TransportOptions::default();
        options.apply_overrides(&|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(options.request_timeout_secs, 2);
        assert_eq!(options.partition_count, 3);
        assert_eq!(options.port_reuse_mode, PortReuseMode::PrivatePortPool);
        assert_eq!(options.max_channels, 65535);
        assert!(options.tls.enabled);
        assert_eq!(options.tls.server_name.as_deref(), Some("sni.example"));
        assert_eq!(options.user_agent, "probe/1.0");
    }

    #[test]
    fn test_validation() {
        assert!(TransportOptions::default()
            .with_partition_count(0)
            .validate()
            .is_err());
        assert!(TransportOptions::default()
            .with_partition_count(9)
            .validate()
            .is_err());
        assert!(TransportOptions::default()
            .with_partition_count(8)
            .validate()
            .is_ok());
        assert!(TransportOptions::default()
            .with_request_timeout(Duration::from_millis(500))
            .validate()
            .is_err());

        let mut options = TransportOptions::default();
        options.receive_hang_detection_secs = 10;
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("receive_hang_detection_secs"));

        let mut options = TransportOptions::default();
        options.send_hang_detection_secs = 2;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_channels_per_partition() {
        let options = TransportOptions::default()
            .with_max_channels(10)
            .with_partition_count(3);
        assert_eq!(options.max_channels_per_partition(), 4);
        assert_eq!(
            TransportOptions::default()
                .with_max_channels(8)
                .max_channels_per_partition(),
            8
        );
    }
}
