use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::error::wire;
use crate::protocol::{MAX_MESSAGE_BYTES, ProtocolHandler, is_rejection};

/// Inbound MCP over HTTP: `POST /mcp`.
pub fn router(handler: Arc<ProtocolHandler>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        // Above the protocol cap so oversize requests reach our own check
        // and get the JSON-RPC envelope instead of a bare 413.
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_BYTES * 2))
        .with_state(handler)
}

pub async fn serve(
    handler: Arc<ProtocolHandler>,
    listen: &str,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let app = router(handler);
    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listen, "HTTP MCP surface started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    info!("HTTP MCP surface stopped");
    Ok(())
}

async fn handle_mcp(
    State(handler): State<Arc<ProtocolHandler>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let version = handler.negotiated_version();

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": wire::INVALID_REQUEST,
                "message": format!("unsupported content type '{content_type}'"),
            },
        });
        return respond(StatusCode::BAD_REQUEST, &version, envelope);
    }

    let raw = String::from_utf8_lossy(&body);
    match handler.handle_text(&raw).await {
        Some(response) => {
            // Parse/validation failures are HTTP 400; everything else,
            // including JSON-RPC error envelopes, is a valid 200 response.
            let status = if is_rejection(&response) {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::OK
            };
            respond(status, &version, response)
        }
        // Notification: nothing to send back.
        None => {
            let mut response = StatusCode::ACCEPTED.into_response();
            set_mcp_headers(&mut response, &version);
            response
        }
    }
}

fn respond(status: StatusCode, version: &str, body: serde_json::Value) -> Response {
    let mut response = (status, body.to_string()).into_response();
    set_mcp_headers(&mut response, version);
    response
}

fn set_mcp_headers(response: &mut Response, version: &str) {
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = header::HeaderValue::from_str(version) {
        headers.insert("MCP-Protocol-Version", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::overlay::CustomToolOverlay;
    use crate::registry::ToolRegistry;
    use crate::result_cache::ResultCache;
    use crate::service::manager::ServiceManager;
    use crate::testutil::{MockTransport, test_config};
    use serde_json::Value;

    async fn serve_on_ephemeral() -> String {
        let bus = Arc::new(EventBus::new());
        let registry = ToolRegistry::new();
        let manager = ServiceManager::new(registry, CustomToolOverlay::empty(), bus);
        let transport = MockTransport::new(&["calculator"]);
        let service = manager.register_service("svc", test_config(), Box::new(transport));
        service.connect().await.unwrap();

        let cache = ResultCache::new();
        let config: Config = serde_yaml_ng::from_str("{}").unwrap();
        let handler = ProtocolHandler::new(manager, cache, &config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(handler);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    async fn post_json(url: &str, body: String) -> (StatusCode, HeaderMap, Value) {
        post_raw(url, body, "application/json").await
    }

    async fn post_raw(url: &str, body: String, content_type: &str) -> (StatusCode, HeaderMap, Value) {
        let client = reqwest::Client::new();
        let response = client
            .post(url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(n), Ok(v)) = (
                header::HeaderName::from_bytes(name.as_str().as_bytes()),
                header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(n, v);
            }
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        (status, headers, body)
    }

    #[tokio::test]
    async fn test_valid_request_gets_200_and_headers() {
        let url = serve_on_ephemeral().await;
        let (status, headers, body) = post_json(
            &url,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(headers.contains_key("MCP-Protocol-Version"));
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let tools = body["result"]["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], "svc__calculator");
    }

    #[tokio::test]
    async fn test_tool_error_is_still_200() {
        let url = serve_on_ephemeral().await;
        let (status, _, body) = post_json(
            &url,
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "ghost__tool"}
            })
            .to_string(),
        )
        .await;

        // A JSON-RPC error envelope is a valid response body.
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_garbled_json_is_400_with_parse_error() {
        let url = serve_on_ephemeral().await;
        let (status, _, body) = post_json(&url, "{definitely not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_oversize_body_is_400_too_large() {
        let url = serve_on_ephemeral().await;
        let huge = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"ping","params":{{"pad":"{}"}}}}"#,
            "x".repeat(MAX_MESSAGE_BYTES)
        );
        let (status, _, body) = post_json(&url, huge).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], -32600);
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("too large")
        );
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_400() {
        let url = serve_on_ephemeral().await;
        let (status, _, body) = post_raw(
            &url,
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
            "text/plain",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_notification_gets_202() {
        let url = serve_on_ephemeral().await;
        let client = reqwest::Client::new();
        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 202);
    }
}
