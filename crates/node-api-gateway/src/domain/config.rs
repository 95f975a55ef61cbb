//! Gateway configuration with validation.
//!
//! Loaded from an optional TOML file, then overridden by `NODE_API_*`
//! environment variables, then validated.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "NODE_API_";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// REST and WebSocket listener
    pub api: ApiConfig,
    /// Streaming JSON-RPC listener
    pub rpc: RpcConfig,
    /// Metrics and health listener
    pub metrics: MetricsConfig,
    /// Node connection target and session tuning
    pub node: NodeConfig,
    /// Log level and format
    pub logging: LoggingConfig,
    /// Request size and time limits
    pub limits: LimitsConfig,
    /// CORS configuration
    pub cors: CorsConfig,
}

impl GatewayConfig {
    /// Load from `path` (if given), apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `NODE_API_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("API_ADDRESS") {
            self.api.listen_address = parse_env("API_ADDRESS", &v)?;
        }
        if let Some(v) = var("API_PORT") {
            self.api.listen_port = parse_env("API_PORT", &v)?;
        }
        if let Some(v) = var("RPC_PORT") {
            self.rpc.listen_port = parse_env("RPC_PORT", &v)?;
        }
        if let Some(v) = var("RPC_MAX_PAGE_ITEMS") {
            self.rpc.max_page_items = parse_env("RPC_MAX_PAGE_ITEMS", &v)?;
        }
        if let Some(v) = var("METRICS_PORT") {
            self.metrics.listen_port = parse_env("METRICS_PORT", &v)?;
        }
        if let Some(v) = var("NETWORK") {
            self.node.network = v;
        }
        if let Some(v) = var("NETWORK_MAGIC") {
            self.node.network_magic = Some(parse_env("NETWORK_MAGIC", &v)?);
        }
        if let Some(v) = var("SOCKET_PATH") {
            self.node.socket_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("NODE_ADDRESS") {
            self.node.address = Some(v);
        }
        if let Some(v) = var("NODE_PORT") {
            self.node.port = Some(parse_env("NODE_PORT", &v)?);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ports = vec![self.api.listen_port];
        if self.rpc.enabled {
            ports.push(self.rpc.listen_port);
        }
        if self.metrics.enabled {
            ports.push(self.metrics.listen_port);
        }
        // Port 0 asks the OS for a free port and never collides.
        ports.retain(|port| *port != 0);
        let mut unique = ports.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != ports.len() {
            return Err(ConfigError::DuplicatePorts);
        }

        if self.node.event_buffer == 0 {
            return Err(ConfigError::Invalid("node.event_buffer cannot be 0".into()));
        }
        if self.node.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("node.call_timeout cannot be 0".into()));
        }
        if self.rpc.max_page_items == 0 {
            return Err(ConfigError::Invalid("rpc.max_page_items cannot be 0".into()));
        }
        if self.limits.max_body_size == 0 {
            return Err(ConfigError::Invalid("limits.max_body_size cannot be 0".into()));
        }

        self.node.network_magic()?;
        self.node.target()?;
        Ok(())
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.api.listen_address, self.api.listen_port)
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.api.listen_address, self.rpc.listen_port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.api.listen_address, self.metrics.listen_port)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    })
}

/// REST and WebSocket listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_address: IpAddr,
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8080,
        }
    }
}

/// Streaming JSON-RPC listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    pub listen_port: u16,
    pub max_connections: u32,
    /// Upper bound on blocks per `sync_dumpHistory` page; larger requests are clamped
    pub max_page_items: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 9090,
            max_connections: 100,
            max_page_items: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 8081,
        }
    }
}

/// Node connection target and per-session tuning.
///
/// Exactly one target must resolve: `address` + `port` for TCP, or
/// `socket_path` for a local socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Named network, used to derive the magic when none is given
    pub network: String,
    pub network_magic: Option<u32>,
    pub socket_path: Option<PathBuf>,
    pub address: Option<String>,
    pub port: Option<u16>,
    /// Keep-alive is only negotiated on TCP connections
    pub keep_alive: bool,
    /// Deadline for any single node call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Capacity of the per-session event channel
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            network_magic: None,
            socket_path: Some(PathBuf::from("/node-ipc/node.socket")),
            address: None,
            port: None,
            keep_alive: true,
            call_timeout: Duration::from_secs(30),
            event_buffer: 10,
        }
    }
}

impl NodeConfig {
    pub fn network_magic(&self) -> Result<u32, ConfigError> {
        if let Some(magic) = self.network_magic {
            return Ok(magic);
        }
        network_magic_for(&self.network)
            .ok_or_else(|| ConfigError::UnknownNetwork(self.network.clone()))
    }

    /// Resolve the single connection target.
    pub fn target(&self) -> Result<NodeTarget, ConfigError> {
        match (&self.address, self.port) {
            (Some(address), Some(_)) if address.trim().is_empty() => Err(ConfigError::Invalid(
                "node.address cannot be empty when node.port is set".into(),
            )),
            (Some(address), Some(port)) => Ok(NodeTarget::Tcp {
                host: address.clone(),
                port,
            }),
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::Invalid(
                "node.address and node.port must be set together".into(),
            )),
            _ => match &self.socket_path {
                Some(path) if !path.as_os_str().is_empty() => Ok(NodeTarget::Unix(path.clone())),
                _ => Err(ConfigError::NoNodeTarget),
            },
        }
    }
}

/// Where the node listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl NodeTarget {
    pub fn is_tcp(&self) -> bool {
        matches!(self, NodeTarget::Tcp { .. })
    }
}

impl std::fmt::Display for NodeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeTarget::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            NodeTarget::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Magic numbers of the public networks.
pub fn network_magic_for(name: &str) -> Option<u32> {
    match name.to_ascii_lowercase().as_str() {
        "mainnet" => Some(764_824_073),
        "preprod" => Some(1),
        "preview" => Some(2),
        "sanchonet" => Some(4),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or full `EnvFilter` directive
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum request body in bytes
    pub max_body_size: usize,
    /// Deadline for single-shot HTTP requests (not WebSocket streams)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1024 * 1024,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    /// Max age for preflight cache, in seconds
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            allowed_headers: vec!["Content-Type".to_string(), "Accept".to_string()],
            max_age: 86400,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("cannot parse config: {0}")]
    Parse(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: String, value: String },
    #[error("duplicate ports configured")]
    DuplicatePorts,
    #[error("unknown network {0:?} and no network_magic given")]
    UnknownNetwork(String),
    #[error("no node target: set node.address and node.port, or node.socket_path")]
    NoNodeTarget,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.listen_port, 8080);
        assert_eq!(config.metrics.listen_port, 8081);
        assert_eq!(config.node.event_buffer, 10);
        assert_eq!(config.node.network_magic().unwrap(), 764_824_073);
        assert_eq!(
            config.node.target().unwrap(),
            NodeTarget::Unix(PathBuf::from("/node-ipc/node.socket"))
        );
    }

    #[test]
    fn test_duplicate_ports() {
        let mut config = GatewayConfig::default();
        config.rpc.listen_port = config.api.listen_port;
        assert_eq!(config.validate(), Err(ConfigError::DuplicatePorts));

        config.rpc.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tcp_target_wins_over_socket() {
        let mut node = NodeConfig::default();
        node.address = Some("node.local".into());
        node.port = Some(3001);
        assert_eq!(
            node.target().unwrap(),
            NodeTarget::Tcp {
                host: "node.local".into(),
                port: 3001
            }
        );
    }

    #[test]
    fn test_missing_or_partial_target_is_config_error() {
        let mut node = NodeConfig {
            socket_path: None,
            ..NodeConfig::default()
        };
        assert_eq!(node.target(), Err(ConfigError::NoNodeTarget));

        node.address = Some("node.local".into());
        assert!(matches!(node.target(), Err(ConfigError::Invalid(_))));

        node.address = None;
        node.port = Some(3001);
        assert!(matches!(node.target(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_address_does_not_fall_back_to_socket() {
        let mut config = GatewayConfig::default();
        config.node.address = Some(String::new());
        config.node.port = Some(3001);
        assert!(matches!(config.node.target(), Err(ConfigError::Invalid(_))));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.node.address = Some("  ".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_page_size_limit() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.rpc.max_page_items, 100);

        config.rpc.max_page_items = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config
            .apply_env(|k| (k == "NODE_API_RPC_MAX_PAGE_ITEMS").then(|| "25".to_string()))
            .unwrap();
        assert_eq!(config.rpc.max_page_items, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_magic() {
        let mut node = NodeConfig {
            network: "preview".into(),
            ..NodeConfig::default()
        };
        assert_eq!(node.network_magic().unwrap(), 2);

        node.network = "nowhere".into();
        assert!(matches!(node.network_magic(), Err(ConfigError::UnknownNetwork(_))));

        node.network_magic = Some(42);
        assert_eq!(node.network_magic().unwrap(), 42);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NODE_API_API_PORT", "9999"),
            ("NODE_API_NETWORK", "preprod"),
            ("NODE_API_NODE_ADDRESS", "10.0.0.5"),
            ("NODE_API_NODE_PORT", "3001"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.api.listen_port, 9999);
        assert_eq!(config.node.network_magic().unwrap(), 1);
        assert!(config.node.target().unwrap().is_tcp());
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_env(|k| (k == "NODE_API_API_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [api]
            listen_port = 8181

            [node]
            network = "preview"
            call_timeout = "500ms"
            event_buffer = 4
            "#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.api.listen_port, 8181);
        assert_eq!(config.node.call_timeout, Duration::from_millis(500));
        assert_eq!(config.node.event_buffer, 4);
        // untouched sections keep their defaults
        assert_eq!(config.metrics.listen_port, 8081);
    }

    #[test]
    fn test_missing_file() {
        let err = GatewayConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_parse_duration() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("soon").is_err());
    }
}
