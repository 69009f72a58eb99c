pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::time::Duration;

use async_trait::async_trait;
use rmcp::service::RunningService;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::{BackendServiceConfig, TransportKind};
use crate::error::GatewayError;
use crate::registry::ToolDescriptor;

/// URL marker for the recognized hosted variant. When a service config
/// carries an `api_key` and its URL matches, a bearer header is injected.
pub const HOSTED_URL_MARKER: &str = "api-inference.modelscope.cn";

pub fn is_hosted_url(url: &str) -> bool {
    url.contains(HOSTED_URL_MARKER)
}

/// An open conversation with one backend.
///
/// Implementations surface exactly one logical close event through
/// [`Channel::wait_closed`]; racing error + close conditions collapse into
/// that single resolution. After `close`, every operation fails with
/// `TransportClosed`.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError>;

    async fn call_tool(
        &self,
        tool: &str,
        args: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;

    /// Liveness probe. Issues a lightweight `tools/list`, which exercises
    /// the same request path tool calls depend on.
    async fn ping(&self, timeout: Duration) -> Result<(), GatewayError>;

    async fn close(&self);

    /// Resolves when the underlying connection closes on its own (at most
    /// once). Channels without native close detection never resolve and rely
    /// on ping probes instead.
    async fn wait_closed(&self) -> String;
}

/// Connection factory for one service. Polymorphic over the three variants.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> Result<Box<dyn Channel>, GatewayError>;
}

/// Build the transport for a service config.
pub fn transport_for(name: &str, config: &BackendServiceConfig) -> Box<dyn Transport> {
    match config.transport {
        TransportKind::Stdio => Box::new(stdio::StdioTransport::new(name.to_string(), config.clone())),
        TransportKind::Sse => Box::new(sse::SseTransport::new(name.to_string(), config.clone())),
        TransportKind::StreamableHttp => Box::new(streamable_http::StreamableHttpTransport::new(
            name.to_string(),
            config.clone(),
        )),
    }
}

// --- Shared rmcp plumbing ---

pub(crate) type McpService = RunningService<rmcp::RoleClient, ()>;

/// Map an rmcp tool list to descriptors.
pub(crate) fn map_tools(tools: Vec<rmcp::model::Tool>) -> Vec<ToolDescriptor> {
    tools
        .into_iter()
        .map(|t| ToolDescriptor {
            name: t.name.to_string(),
            description: t.description.unwrap_or_default().to_string(),
            input_schema: serde_json::to_value(&t.input_schema)
                .unwrap_or(Value::Object(Default::default())),
        })
        .collect()
}

/// Build reqwest default headers from config, injecting the hosted-variant
/// bearer when applicable. `Authorization` is returned separately for
/// transports that carry it out-of-band.
pub(crate) fn build_headers(
    name: &str,
    config: &BackendServiceConfig,
) -> (reqwest::header::HeaderMap, Option<String>) {
    let mut auth: Option<String> = None;
    let mut default_headers = reqwest::header::HeaderMap::new();

    for (key, value) in &config.headers {
        if key.eq_ignore_ascii_case("Authorization") {
            auth = Some(value.clone());
            continue;
        }
        match (
            key.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                default_headers.insert(header_name, header_value);
            }
            _ => {
                warn!(service = %name, header = %key, "skipping unparseable custom header");
            }
        }
    }

    if let (Some(api_key), Some(url)) = (&config.api_key, &config.url)
        && is_hosted_url(url)
    {
        debug!(service = %name, "hosted URL detected, injecting bearer auth");
        auth = Some(format!("Bearer {api_key}"));
    }

    (default_headers, auth)
}

/// rmcp-backed channel shared by the SSE and streamable-http transports.
pub(crate) struct RmcpChannel {
    name: String,
    service: RwLock<Option<McpService>>,
}

impl RmcpChannel {
    pub(crate) fn new(name: String, service: McpService) -> Self {
        Self {
            name,
            service: RwLock::new(Some(service)),
        }
    }
}

#[async_trait]
impl Channel for RmcpChannel {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| GatewayError::TransportClosed {
            service: self.name.clone(),
        })?;
        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| GatewayError::Transport {
                service: self.name.clone(),
                reason: format!("tools/list failed: {e}"),
            })?;
        Ok(map_tools(tools))
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| GatewayError::TransportClosed {
            service: self.name.clone(),
        })?;
        call_tool_on(service, &self.name, tool, args, timeout).await
    }

    async fn ping(&self, timeout: Duration) -> Result<(), GatewayError> {
        tokio::time::timeout(timeout, self.list_tools())
            .await
            .map_err(|_| GatewayError::Timeout {
                operation: format!("ping on service '{}'", self.name),
                millis: timeout.as_millis() as u64,
            })?
            .map(|_| ())
    }

    async fn close(&self) {
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            error!(service = %self.name, error = %e, "error cancelling service");
        }
    }

    async fn wait_closed(&self) -> String {
        // No native close signal on HTTP-family transports; liveness is the
        // ping loop's job.
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Shared tool-call path: deadline, error wrapping, verbatim result
/// mapping.
pub(crate) async fn call_tool_on(
    service: &McpService,
    service_name: &str,
    tool: &str,
    args: Option<Value>,
    timeout: Duration,
) -> Result<Value, GatewayError> {
    let params = rmcp::model::CallToolRequestParams {
        meta: None,
        name: tool.to_string().into(),
        arguments: args.and_then(|v| v.as_object().cloned()),
        task: None,
    };

    debug!(service = %service_name, tool = %tool, "calling tool");

    let result = tokio::time::timeout(timeout, service.call_tool(params))
        .await
        .map_err(|_| GatewayError::Timeout {
            operation: format!("tool call '{tool}' on service '{service_name}'"),
            millis: timeout.as_millis() as u64,
        })?
        .map_err(|e| GatewayError::ToolExecution {
            tool: tool.to_string(),
            reason: format!("service '{service_name}': {e}"),
        })?;

    // Serialize the whole MCP result so content and isError pass through
    // unchanged to the caller.
    serde_json::to_value(&result).map_err(|e| GatewayError::Internal(e.to_string()))
}
