use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level toolgate configuration.
///
/// Ingestion is plain plumbing: the core only ever sees the parsed struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Server identity reported in `initialize` responses.
    #[serde(default)]
    pub server: ServerInfoConfig,

    /// When true, error payloads never include stack data.
    #[serde(default = "default_true_config")]
    pub production: bool,

    /// Backend services keyed by name (the name is the stable identity).
    #[serde(default)]
    pub services: HashMap<String, BackendServiceConfig>,

    /// Locally declared custom tools (shadow or augment backend tools).
    #[serde(default)]
    pub custom_tools: Vec<CustomToolConfig>,

    /// Remote endpoint bridged over a persistent WebSocket.
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,

    /// Platform credentials shared by proxy-handler custom tools.
    #[serde(default)]
    pub platforms: PlatformConfig,

    /// Inbound HTTP surface. None = stdio only.
    #[serde(default)]
    pub http: Option<HttpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfoConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerInfoConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

/// Per-service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendServiceConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Command to spawn (stdio transport). Relative script paths in `args`
    /// resolve against `cwd`.
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables passed to the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process and script resolution.
    pub cwd: Option<String>,

    /// URL for sse / streamable-http transports.
    pub url: Option<String>,

    /// Extra HTTP headers for sse / streamable-http transports.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// API key for the recognized hosted variant. When set and the URL
    /// matches the hosted predicate, an `Authorization: Bearer` header is
    /// injected.
    pub api_key: Option<String>,

    /// Per-tool-call deadline.
    #[serde(default = "default_call_timeout", with = "humantime_duration")]
    pub call_timeout: Duration,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub ping: PingPolicy,

    /// Per-tool enable switches. Tools whose `enable` is false are excluded
    /// from aggregation at the next registry rebuild.
    #[serde(default)]
    pub tools: HashMap<String, ToolToggle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolToggle {
    #[serde(default = "default_true_config")]
    pub enable: bool,
}

/// Transport type for a backend service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Reconnect policy applied after any unexpected loss of connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    #[serde(default = "default_true_config")]
    pub enabled: bool,

    /// 0 = unlimited attempts.
    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default = "default_initial_interval", with = "humantime_duration")]
    pub initial_interval: Duration,

    #[serde(default = "default_max_interval", with = "humantime_duration")]
    pub max_interval: Duration,

    #[serde(default = "default_backoff_strategy")]
    pub backoff_strategy: BackoffStrategy,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Deadline for a single connect attempt (transport open + handshake +
    /// initial tools/list).
    #[serde(default = "default_attempt_timeout", with = "humantime_duration")]
    pub per_attempt_timeout: Duration,

    #[serde(default = "default_true_config")]
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            backoff_strategy: default_backoff_strategy(),
            backoff_multiplier: default_backoff_multiplier(),
            per_attempt_timeout: default_attempt_timeout(),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
}

/// Liveness probing for a connected service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingPolicy {
    #[serde(default = "default_true_config")]
    pub enabled: bool,

    #[serde(default = "default_ping_interval", with = "humantime_duration")]
    pub interval: Duration,

    #[serde(default = "default_ping_timeout", with = "humantime_duration")]
    pub per_ping_timeout: Duration,

    #[serde(default = "default_max_ping_failures")]
    pub max_consecutive_failures: u32,

    /// Delay after connect before the first probe.
    #[serde(default = "default_ping_start_delay", with = "humantime_duration")]
    pub start_delay: Duration,
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_ping_interval(),
            per_ping_timeout: default_ping_timeout(),
            max_consecutive_failures: default_max_ping_failures(),
            start_delay: default_ping_start_delay(),
        }
    }
}

/// A locally declared custom tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_object_schema")]
    pub input_schema: Value,
    pub handler: HandlerConfig,
}

/// Handler variants for custom tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandlerConfig {
    /// Delegate to a platform-specific runner (e.g. a hosted workflow).
    Proxy {
        platform: String,
        #[serde(default)]
        config: HashMap<String, Value>,
    },
    /// Forward as an outbound HTTP call.
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body_template: Option<String>,
    },
    /// Execute in a constrained sandbox.
    Function { code: String, entrypoint: String },
    /// Re-route to a backend tool already in the registry.
    Mcp {
        service_name: String,
        tool_name: String,
    },
}

/// Remote endpoint reached over a persistent WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,

    /// Bearer token appended to the URL query string, if any.
    pub token: Option<String>,

    /// Deadline for each tools/call dispatched from the endpoint side.
    #[serde(default = "default_call_timeout", with = "humantime_duration")]
    pub call_timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Token required by `proxy` custom tools targeting the coze platform.
    pub coze_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

// --- Defaults ---

fn default_log_level() -> String {
    "info".to_string()
}
fn default_server_name() -> String {
    "toolgate".to_string()
}
fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_transport() -> TransportKind {
    TransportKind::Stdio
}
fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_ping_failures() -> u32 {
    3
}
fn default_ping_start_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_true_config() -> bool {
    true
}
fn default_http_method() -> String {
    "POST".to_string()
}
fn default_http_listen() -> String {
    "127.0.0.1:18100".to_string()
}
fn default_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

// --- humantime_duration serde helper ---

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime_format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_format(d: &Duration) -> String {
        let millis = d.as_millis();
        if millis < 1000 || !millis.is_multiple_of(1000) {
            return format!("{millis}ms");
        }
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn humantime_parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            n.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected format like '500ms', '30s', '5m'")
            })
        }
    }
}

// --- Loading ---

impl Config {
    /// Load config from a YAML file.
    ///
    /// Pipeline: read file → shellexpand ${VAR} → deserialize YAML → validate
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            validate_service(name, service)
                .map_err(|reason| anyhow::anyhow!("service '{name}': {reason}"))?;
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.custom_tools {
            if tool.name.is_empty() {
                anyhow::bail!("custom tool with empty name");
            }
            if !seen.insert(tool.name.as_str()) {
                anyhow::bail!("duplicate custom tool name '{}'", tool.name);
            }
            if let HandlerConfig::Proxy { platform, .. } = &tool.handler
                && platform == "coze"
                && self.platforms.coze_token.is_none()
            {
                tracing::warn!(
                    tool = %tool.name,
                    "coze proxy tool declared without platforms.coze_token; calls will fail"
                );
            }
        }
        Ok(())
    }
}

/// Per-service field checks, shared by `Config::validate` and runtime
/// `add_config`.
pub fn validate_service(
    name: &str,
    config: &BackendServiceConfig,
) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("empty service name".to_string());
    }
    match config.transport {
        TransportKind::Stdio => {
            if config.command.is_none() {
                return Err("stdio transport requires 'command' field".to_string());
            }
        }
        TransportKind::Sse | TransportKind::StreamableHttp => {
            if config.url.is_none() {
                return Err(format!(
                    "{:?} transport requires 'url' field",
                    config.transport
                ));
            }
        }
    }
    if config.reconnect.backoff_multiplier < 1.0 {
        return Err("reconnect.backoff_multiplier must be >= 1.0".to_string());
    }
    if config.ping.enabled && config.ping.interval.is_zero() {
        return Err("ping.interval must be > 0 when ping is enabled".to_string());
    }
    Ok(())
}
