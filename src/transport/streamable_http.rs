use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use tracing::info;

use super::{Channel, RmcpChannel, Transport, build_headers};
use crate::config::{BackendServiceConfig, TransportKind};
use crate::error::GatewayError;

/// Streamable-HTTP transport: one long-lived request whose body is a stream
/// of framed JSON messages in each direction.
pub struct StreamableHttpTransport {
    name: String,
    config: BackendServiceConfig,
}

impl StreamableHttpTransport {
    pub fn new(name: String, config: BackendServiceConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, GatewayError> {
        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| GatewayError::ConfigInvalid {
                service: self.name.clone(),
                reason: "streamable-http transport requires 'url'".to_string(),
            })?;

        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url);

        // Authorization travels through the transport config; everything
        // else becomes a reqwest default header.
        let (default_headers, auth) = build_headers(&self.name, &self.config);
        if let Some(auth) = auth {
            let token = auth.strip_prefix("Bearer ").unwrap_or(&auth);
            transport_config = transport_config.auth_header(token);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| GatewayError::Transport {
                service: self.name.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        let service = ()
            .serve(transport)
            .await
            .map_err(|e| GatewayError::Handshake {
                service: self.name.clone(),
                reason: format!("at {url}: {e}"),
            })?;

        if let Some(peer) = service.peer_info() {
            info!(
                service = %self.name,
                url = %url,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "HTTP MCP handshake complete"
            );
        } else {
            info!(service = %self.name, url = %url, "HTTP MCP handshake complete (no peer info)");
        }

        Ok(Box::new(RmcpChannel::new(self.name.clone(), service)))
    }
}
