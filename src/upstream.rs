use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::EndpointConfig;
use crate::error::{classify_tool_call_error, wire};
use crate::events::{EventBus, GatewayEvent};
use crate::protocol::{MAX_MESSAGE_BYTES, ProtocolHandler};

/// Deadline for the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for the reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Persistent client to the remote endpoint.
///
/// The gateway dials out; the endpoint then issues MCP requests over the
/// socket, which are served through the [`ProtocolHandler`]. Writes are
/// serialized through a single writer task; each `tools/call` carries its
/// own deadline and the endpoint-facing error-code contract.
pub struct UpstreamClient {
    config: EndpointConfig,
    handler: Arc<ProtocolHandler>,
    bus: Arc<EventBus>,
    connected: AtomicBool,
    connecting: AtomicBool,
    shutdown: CancellationToken,
}

impl UpstreamClient {
    pub fn new(
        config: EndpointConfig,
        handler: Arc<ProtocolHandler>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            bus,
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stop the client and close the socket cleanly.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawn the connect/reconnect loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await })
    }

    fn endpoint_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.config.url)?;
        if let Some(token) = &self.config.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    async fn run(self: Arc<Self>) {
        let url = match self.endpoint_url() {
            Ok(url) => url,
            Err(e) => {
                error!(url = %self.config.url, error = %e, "invalid endpoint URL");
                return;
            }
        };
        let display_url = self.config.url.clone();

        let mut retry: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            // One connect at a time.
            if self.connecting.swap(true, Ordering::AcqRel) {
                warn!("endpoint connect already in progress");
                return;
            }

            info!(url = %display_url, "connecting to endpoint");
            let connect = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                tokio_tungstenite::connect_async(url.as_str()),
            );

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Still CONNECTING: drop the attempt outright.
                    self.connecting.store(false, Ordering::Release);
                    return;
                }
                result = connect => result,
            };
            self.connecting.store(false, Ordering::Release);

            match result {
                Ok(Ok((stream, _response))) => {
                    retry = 0;
                    self.set_connected(true, &display_url);
                    self.handle_connection(stream).await;
                    self.set_connected(false, &display_url);
                    if self.shutdown.is_cancelled() {
                        return;
                    }
                    info!(url = %display_url, "endpoint connection lost, reconnecting");
                }
                Ok(Err(e)) => {
                    warn!(url = %display_url, error = %e, "endpoint connect failed");
                }
                Err(_) => {
                    warn!(
                        url = %display_url,
                        timeout_secs = HANDSHAKE_TIMEOUT.as_secs(),
                        "endpoint handshake timed out"
                    );
                }
            }

            retry += 1;
            let delay = Duration::from_secs(2u64.saturating_pow(retry.min(6)))
                .min(MAX_RECONNECT_DELAY);
            debug!(delay_secs = delay.as_secs(), "endpoint reconnect backoff");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut write, mut read) = stream.split();
        // All frame writes funnel through this channel so WebSocket framing
        // is never interleaved.
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Clean close: code 1000 with the standard reason.
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Cleaning up connection".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "error sending close frame");
                    }
                    return;
                }

                outgoing = rx.recv() => {
                    let Some(message) = outgoing else { return };
                    if !self.is_connected() {
                        warn!("dropping endpoint response: socket is not open");
                        continue;
                    }
                    if let Err(e) = write.send(message).await {
                        warn!(error = %e, "endpoint write failed");
                        return;
                    }
                }

                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let client = Arc::clone(self);
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                if let Some(response) = client.dispatch(text.to_string()).await {
                                    let _ = tx.send(Message::Text(response.to_string().into())).await;
                                }
                            });
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = tx.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(frame = ?frame, "endpoint closed the connection");
                            return;
                        }
                        Some(Ok(_)) => {} // binary/pong frames ignored
                        Some(Err(e)) => {
                            warn!(error = %e, "endpoint read failed");
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Serve one frame. `tools/call` gets the per-call deadline and the
    /// keyword-based error-code contract.
    async fn dispatch(&self, text: String) -> Option<Value> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {
                    "code": wire::INVALID_REQUEST,
                    "message": format!(
                        "message too large: {} bytes exceeds the 1 MiB limit",
                        text.len()
                    ),
                },
            }));
        }

        let parsed = serde_json::from_str::<Value>(&text).ok();
        let is_tool_call = parsed
            .as_ref()
            .and_then(|v| v.get("method").and_then(Value::as_str))
            == Some("tools/call");

        if !is_tool_call {
            return self.handler.handle_text(&text).await;
        }

        let id = parsed
            .and_then(|v| v.get("id").cloned())
            .unwrap_or(Value::Null);

        let deadline = self.config.call_timeout;
        match tokio::time::timeout(deadline, self.handler.handle_text(&text)).await {
            Ok(response) => response.map(apply_error_code_contract),
            Err(_) => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": wire::TIMEOUT,
                    "message": format!(
                        "tool call timed out after {}ms",
                        deadline.as_millis()
                    ),
                },
            })),
        }
    }

    fn set_connected(&self, connected: bool, url: &str) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            info!(url = %url, "endpoint connected");
        }
        self.bus.publish(GatewayEvent::EndpointStatusChanged {
            connected,
            url: url.to_string(),
        });
    }
}

/// Re-map generic failure codes by their stable message keywords so the
/// endpoint can rely on the published contract.
fn apply_error_code_contract(mut response: Value) -> Value {
    let Some(error) = response.get_mut("error") else {
        return response;
    };
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == wire::TOOL_EXECUTION_ERROR || code == wire::INTERNAL_ERROR {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let reclassified = classify_tool_call_error(message);
        error["code"] = json!(reclassified);
    }
    response
}
