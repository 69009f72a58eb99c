//! End-to-end protocol compliance tests.
//!
//! Exercises the full stack (protocol dispatch, routing, overlay, result
//! cache, registry) over `handle_text`, the same entry point the stdio and
//! HTTP surfaces use. Backends are mock transports; no child processes or
//! sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::config::{Config, CustomToolConfig, HandlerConfig, PlatformConfig};
use crate::events::EventBus;
use crate::overlay::CustomToolOverlay;
use crate::protocol::ProtocolHandler;
use crate::registry::ToolRegistry;
use crate::result_cache::ResultCache;
use crate::service::ConnectionState;
use crate::service::manager::ServiceManager;
use crate::testutil::{MockState, MockTransport, test_config};

struct Gateway {
    manager: Arc<ServiceManager>,
    handler: Arc<ProtocolHandler>,
    bus: Arc<EventBus>,
}

impl Gateway {
    async fn with_overlay(overlay: Arc<CustomToolOverlay>) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = ToolRegistry::new();
        let manager = ServiceManager::new(registry, overlay, Arc::clone(&bus));
        manager.refresh();

        let cache = ResultCache::new();
        let mut config: Config = serde_yaml_ng::from_str("{}").unwrap();
        config.server.name = "test-gateway".to_string();
        let handler = ProtocolHandler::new(Arc::clone(&manager), cache, &config);

        Self {
            manager,
            handler,
            bus,
        }
    }

    async fn new() -> Self {
        Self::with_overlay(CustomToolOverlay::empty()).await
    }

    async fn start_backend(&self, name: &str, tools: &[&str]) -> Arc<MockState> {
        let transport = MockTransport::new(tools);
        let state = transport.ping_state();
        let service = self
            .manager
            .register_service(name, test_config(), Box::new(transport));
        service.connect().await.unwrap();
        state
    }

    async fn request(&self, body: Value) -> Value {
        self.handler
            .handle_text(&body.to_string())
            .await
            .expect("expected a response")
    }
}

#[tokio::test]
async fn test_full_handshake_then_list_then_call() {
    let gateway = Gateway::new().await;
    let backend = gateway.start_backend("svc", &["calculator", "datetime"]).await;
    backend.set_call_result(
        "calculator",
        json!({"content": [{"type": "text", "text": "2"}], "isError": false}),
    );

    // initialize with an unknown version: graceful downgrade, configured
    // server name reported.
    let response = gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "1999-01-01", "clientInfo": {"name": "t"}}
        }))
        .await;
    assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(response["result"]["serverInfo"]["name"], "test-gateway");

    // notifications/initialized produces no response.
    assert!(
        gateway
            .handler
            .handle_text(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
            .await
            .is_none()
    );

    // tools/list shows exactly the prefixed names.
    let response = gateway
        .request(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["svc__calculator", "svc__datetime"]);

    // tools/call routes to the backend under the original name and returns
    // the backend's result verbatim.
    let response = gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "svc__calculator", "arguments": {"expression": "1+1"}}
        }))
        .await;
    assert_eq!(response["result"]["content"][0]["text"], "2");

    let log = backend.call_log();
    assert_eq!(log, vec![(
        "calculator".to_string(),
        Some(json!({"expression": "1+1"}))
    )]);
}

#[tokio::test]
async fn test_overlay_shadows_backend_over_the_wire() {
    let overlay = CustomToolOverlay::load_from_config(
        &[CustomToolConfig {
            name: "calculator".to_string(),
            description: "custom calculator".to_string(),
            input_schema: json!({"type": "object"}),
            handler: HandlerConfig::Mcp {
                service_name: "svc".to_string(),
                tool_name: "datetime".to_string(),
            },
        }],
        PlatformConfig::default(),
    )
    .unwrap();

    let gateway = Gateway::with_overlay(overlay).await;
    let backend = gateway.start_backend("svc", &["calculator", "datetime"]).await;

    let response = gateway
        .request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    let tools = response["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    // Custom 'calculator' plus both prefixed backend tools.
    assert!(names.contains(&"calculator"));
    assert!(names.contains(&"svc__calculator"));
    assert!(names.contains(&"svc__datetime"));

    // Calling the bare name goes through the overlay's mcp rewrite, not the
    // backend's own 'calculator'.
    gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "calculator", "arguments": {}}
        }))
        .await;
    let log = backend.call_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, "datetime");
}

#[tokio::test]
async fn test_registry_only_lists_connected_services() {
    let gateway = Gateway::new().await;
    gateway.start_backend("up", &["a"]).await;
    gateway.start_backend("down", &["b"]).await;

    gateway.manager.stop("down").await.unwrap();
    assert_eq!(
        gateway.manager.service("down").unwrap().state(),
        ConnectionState::Disconnected
    );

    let response = gateway
        .request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["up__a"]);

    // Calls to the stopped service's tools are "gone", not "temporarily
    // down".
    let response = gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "down__b", "arguments": {}}
        }))
        .await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn test_call_results_are_cached_one_shot() {
    let gateway = Gateway::new().await;
    gateway.start_backend("svc", &["echo"]).await;

    let args = json!({"q": "x"});
    gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "svc__echo", "arguments": args}
        }))
        .await;

    let key = crate::result_cache::cache_key("svc__echo", &args);
    let cache = &gateway.handler.cache;
    assert!(cache.is_available(&key));

    // One-shot: consuming flips availability permanently.
    assert!(cache.mark_consumed(&key));
    assert!(!cache.is_available(&key));
    assert!(cache.validate().is_empty());
}

#[tokio::test]
async fn test_failed_call_is_cached_as_failed() {
    let gateway = Gateway::new().await;
    let backend = gateway.start_backend("svc", &["echo"]).await;
    backend.fail_calls(true);

    let response = gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "svc__echo", "arguments": {}}
        }))
        .await;
    assert_eq!(response["error"]["code"], -32000);

    let key = crate::result_cache::cache_key("svc__echo", &json!({}));
    let entry = gateway.handler.cache.get(&key).unwrap();
    assert_eq!(entry.status, crate::result_cache::TaskStatus::Failed);
    assert!(!entry.error.unwrap().is_empty());
    assert!(gateway.handler.cache.validate().is_empty());
}

#[tokio::test]
async fn test_events_fire_in_order_across_the_stack() {
    let gateway = Gateway::new().await;

    let topics = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&topics);
    gateway
        .bus
        .subscribe(move |e| sink.lock().unwrap().push(e.topic().to_string()));

    gateway.start_backend("svc", &["t"]).await;
    gateway.manager.stop("svc").await.unwrap();

    let seen = topics.lock().unwrap().clone();
    let connected = seen.iter().position(|t| t == "service:connected").unwrap();
    let registry_change = seen
        .iter()
        .position(|t| t == "tool-registry:changed")
        .unwrap();
    let disconnected = seen
        .iter()
        .position(|t| t == "service:disconnected")
        .unwrap();

    // connected fires before the tools become discoverable; disconnected
    // fires after they are gone.
    assert!(connected < registry_change);
    assert!(registry_change < disconnected);
}

#[tokio::test]
async fn test_collision_between_backends_is_disambiguated() {
    let gateway = Gateway::new().await;
    // Normalisation maps both to the 'team_svc' prefix.
    gateway.start_backend("team-svc", &["run"]).await;
    gateway.start_backend("team_svc", &["run"]).await;

    let response = gateway
        .request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    let mut names: Vec<String> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["team_svc__run", "team_svc__run_2"]);

    // Both names remain routable to their own backends.
    let response = gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "team_svc__run_2", "arguments": {}}
        }))
        .await;
    assert!(response.get("result").is_some());
}

#[tokio::test]
async fn test_reconnect_delay_window_observed() {
    // Scenario: transport close after Connected; a new attempt lands within
    // [initial*0.5, initial*1.5] when jitter is on.
    let bus = Arc::new(EventBus::new());
    let registry = ToolRegistry::new();
    let manager = ServiceManager::new(registry, CustomToolOverlay::empty(), bus);

    let transport = MockTransport::new(&["t"]);
    let state = transport.ping_state();
    let connects = transport.connect_count();

    let mut config = test_config();
    config.reconnect.initial_interval = Duration::from_millis(100);
    config.reconnect.per_attempt_timeout = Duration::from_secs(1);
    config.reconnect.jitter = true;

    let service = manager.register_service("svc", config, Box::new(transport));
    service.connect().await.unwrap();

    let lost_at = std::time::Instant::now();
    state.trigger_close("simulated close");

    tokio::time::timeout(Duration::from_secs(2), async {
        while connects.load(std::sync::atomic::Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("reconnect should happen");

    let elapsed = lost_at.elapsed();
    // Lower bound from the jitter window; upper bound is loose to absorb
    // scheduling noise.
    assert!(
        elapsed >= Duration::from_millis(45),
        "reconnected too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(600),
        "reconnected too late: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_http_handler_custom_tool_end_to_end() {
    // A custom http tool served by a local axum stub.
    use axum::{Router, routing::post};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/run",
        post(|body: String| async move {
            let args: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            json!({"echoed": args}).to_string()
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let overlay = CustomToolOverlay::load_from_config(
        &[CustomToolConfig {
            name: "remote_echo".to_string(),
            description: "echo via HTTP".to_string(),
            input_schema: json!({"type": "object"}),
            handler: HandlerConfig::Http {
                url: format!("http://{addr}/run"),
                method: "POST".to_string(),
                headers: HashMap::new(),
                body_template: None,
            },
        }],
        PlatformConfig::default(),
    )
    .unwrap();

    let gateway = Gateway::with_overlay(overlay).await;
    let response = gateway
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "remote_echo", "arguments": {"ping": true}}
        }))
        .await;

    assert_eq!(response["result"]["isError"], false);
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("ping"), "text: {text}");
}
