use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::transport::{SseClientTransport, sse_client::SseClientConfig};
use tracing::info;

use super::{Channel, RmcpChannel, Transport, build_headers};
use crate::config::{BackendServiceConfig, TransportKind};
use crate::error::GatewayError;

/// Server-Sent-Events transport. The backend streams messages over
/// `text/event-stream` and advertises a companion POST endpoint during the
/// handshake; rmcp's SSE client drives both halves.
pub struct SseTransport {
    name: String,
    config: BackendServiceConfig,
}

impl SseTransport {
    pub fn new(name: String, config: BackendServiceConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, GatewayError> {
        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| GatewayError::ConfigInvalid {
                service: self.name.clone(),
                reason: "sse transport requires 'url'".to_string(),
            })?;

        let (mut default_headers, auth) = build_headers(&self.name, &self.config);
        if let Some(auth) = auth
            && let Ok(value) = auth.parse::<reqwest::header::HeaderValue>()
        {
            default_headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| GatewayError::Transport {
                service: self.name.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let transport = SseClientTransport::start_with_client(
            client,
            SseClientConfig {
                sse_endpoint: url.to_string().into(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| GatewayError::Transport {
            service: self.name.clone(),
            reason: format!("failed to open SSE stream at {url}: {e}"),
        })?;

        let service = ()
            .serve(transport)
            .await
            .map_err(|e| GatewayError::Handshake {
                service: self.name.clone(),
                reason: e.to_string(),
            })?;

        if let Some(peer) = service.peer_info() {
            info!(
                service = %self.name,
                url = %url,
                server_name = %peer.server_info.name,
                "SSE MCP handshake complete"
            );
        } else {
            info!(service = %self.name, url = %url, "SSE MCP handshake complete (no peer info)");
        }

        Ok(Box::new(RmcpChannel::new(self.name.clone(), service)))
    }
}
