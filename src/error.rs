use thiserror::Error;

use crate::service::ConnectionState;

/// JSON-RPC error codes surfaced to upstream consumers.
pub mod wire {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const TOOL_EXECUTION_ERROR: i64 = -32000;
    pub const SERVICE_UNAVAILABLE: i64 = -32001;
    pub const TIMEOUT: i64 = -32002;
}

/// Stable keyword indicators used to classify free-form tool-call failures.
///
/// Acceptance matches the whole list case-insensitively; emission uses the
/// first (canonical) form of each group.
pub mod indicators {
    pub const TOOL_NOT_FOUND: &[&str] = &["tool not found", "not found"];
    pub const SERVICE_UNAVAILABLE: &[&str] = &["unavailable", "not available"];
    pub const TIMEOUT: &[&str] = &["timed out", "timeout"];
}

/// Error type shared across the gateway core.
///
/// Each variant corresponds to one kind in the recovery taxonomy; the wire
/// mapping is centralised in [`GatewayError::wire_code`] so transports and
/// protocol surfaces never hand-roll code constants.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration rejected before any connection attempt.
    #[error("invalid config for service '{service}': {reason}")]
    ConfigInvalid { service: String, reason: String },

    /// Byte-level transport failure (spawn, socket, stream).
    #[error("transport error on service '{service}': {reason}")]
    Transport { service: String, reason: String },

    /// MCP handshake or initial tools/list failure.
    #[error("handshake with service '{service}' failed: {reason}")]
    Handshake { service: String, reason: String },

    /// Deadline exceeded on a connect, ping, or tool call.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    /// The named tool does not exist in the registry or on the backend.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },

    /// Arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool executed and reported failure.
    #[error("tool '{tool}' execution failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    /// The owning service exists but cannot take calls right now.
    #[error("service '{service}' unavailable (state: {state:?})")]
    ServiceUnavailable {
        service: String,
        state: ConnectionState,
    },

    /// Malformed JSON on an inbound surface.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structurally invalid JSON-RPC request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A connect was requested while one is already in progress.
    #[error("service '{service}' is already connecting")]
    AlreadyConnecting { service: String },

    /// Operation requires a live connection.
    #[error("service '{service}' is not connected")]
    NotConnected { service: String },

    /// The transport observed its close event; no further sends possible.
    #[error("transport for service '{service}' is closed")]
    TransportClosed { service: String },

    /// Pending operation resolved by shutdown or config removal.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// Last resort.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to the JSON-RPC error code visible on the wire.
    pub fn wire_code(&self) -> i64 {
        match self {
            GatewayError::Parse(_) => wire::PARSE_ERROR,
            GatewayError::InvalidRequest(_) => wire::INVALID_REQUEST,
            GatewayError::ToolNotFound { .. } => wire::METHOD_NOT_FOUND,
            GatewayError::InvalidArguments { .. } | GatewayError::ConfigInvalid { .. } => {
                wire::INVALID_PARAMS
            }
            GatewayError::Timeout { .. } => wire::TIMEOUT,
            GatewayError::ServiceUnavailable { .. } => wire::SERVICE_UNAVAILABLE,
            GatewayError::ToolExecution { .. }
            | GatewayError::Transport { .. }
            | GatewayError::Handshake { .. }
            | GatewayError::TransportClosed { .. }
            | GatewayError::NotConnected { .. } => wire::TOOL_EXECUTION_ERROR,
            GatewayError::AlreadyConnecting { .. }
            | GatewayError::Cancelled { .. }
            | GatewayError::Internal(_) => wire::INTERNAL_ERROR,
        }
    }

    /// True when the failure should feed the reconnect policy rather than
    /// surface to the caller of `connect`.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport { .. }
                | GatewayError::Handshake { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::TransportClosed { .. }
        )
    }
}

/// Classify a free-form tool-call failure message into a wire code.
///
/// Used by the upstream client, which only sees rendered messages once a
/// call has crossed the routing boundary. Matching is case-insensitive
/// against the stable indicator lists.
pub fn classify_tool_call_error(message: &str) -> i64 {
    let lower = message.to_lowercase();
    if indicators::TIMEOUT.iter().any(|k| lower.contains(k)) {
        return wire::TIMEOUT;
    }
    if indicators::TOOL_NOT_FOUND.iter().any(|k| lower.contains(k)) {
        return wire::METHOD_NOT_FOUND;
    }
    if indicators::SERVICE_UNAVAILABLE
        .iter()
        .any(|k| lower.contains(k))
    {
        return wire::SERVICE_UNAVAILABLE;
    }
    wire::TOOL_EXECUTION_ERROR
}
