use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::wire;
use crate::result_cache::ResultCache;
use crate::service::manager::ServiceManager;

/// Protocol versions this gateway speaks, newest last.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Version offered to clients requesting an unknown version.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Hard cap for any inbound message, uniform across surfaces.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// MCP JSON-RPC dispatcher.
///
/// Owns version negotiation, strict message validation, the wire error
/// mapping, and task tracking of tool calls through the result cache.
pub struct ProtocolHandler {
    manager: Arc<ServiceManager>,
    pub(crate) cache: Arc<ResultCache>,
    server_name: String,
    server_version: String,
    production: bool,
    negotiated_version: StdMutex<String>,
    client_ready: AtomicBool,
}

impl ProtocolHandler {
    pub fn new(manager: Arc<ServiceManager>, cache: Arc<ResultCache>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            manager,
            cache,
            server_name: config.server.name.clone(),
            server_version: config.server.version.clone(),
            production: config.production,
            negotiated_version: StdMutex::new(DEFAULT_PROTOCOL_VERSION.to_string()),
            client_ready: AtomicBool::new(false),
        })
    }

    /// True once the client has sent `notifications/initialized`.
    pub fn is_client_ready(&self) -> bool {
        self.client_ready.load(Ordering::Acquire)
    }

    /// Version negotiated with the most recent `initialize`.
    pub fn negotiated_version(&self) -> String {
        self.negotiated_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Full inbound pipeline: size check, parse, validate, dispatch.
    /// Returns `None` for notifications.
    pub async fn handle_text(&self, raw: &str) -> Option<Value> {
        if raw.len() > MAX_MESSAGE_BYTES {
            return Some(self.error_response(
                Value::Null,
                wire::INVALID_REQUEST,
                &format!(
                    "message too large: {} bytes exceeds the 1 MiB limit",
                    raw.len()
                ),
                None,
            ));
        }

        let message: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Some(self.error_response(
                    Value::Null,
                    wire::PARSE_ERROR,
                    &format!("parse error: {e}"),
                    None,
                ));
            }
        };

        self.handle_message(message).await
    }

    /// Dispatch one decoded message. Returns `None` for notifications.
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        // The id is echoed exactly, preserving its type. A present-but-null
        // id still marks a request.
        let id = message.get("id").cloned();

        let jsonrpc_ok = message.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
        let method = message.get("method").and_then(Value::as_str);

        if !jsonrpc_ok || method.is_none() {
            return Some(self.error_response(
                id.unwrap_or(Value::Null),
                wire::INVALID_REQUEST,
                "invalid request: expected jsonrpc \"2.0\" and a method",
                None,
            ));
        }
        let method = method.unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match id {
            Some(id) => Some(self.handle_request(id, method, params).await),
            None => {
                self.handle_notification(method);
                None
            }
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: Value) -> Value {
        match method {
            "initialize" => self.handle_initialize(id, &params),
            "tools/list" => {
                let snapshot = self.manager.list_all_tools();
                let tools: Vec<Value> = snapshot
                    .list()
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.input_schema,
                        })
                    })
                    .collect();
                result_response(id, json!({ "tools": tools }))
            }
            "tools/call" => self.handle_tools_call(id, &params).await,
            "resources/list" => result_response(id, json!({ "resources": [] })),
            "prompts/list" => result_response(id, json!({ "prompts": [] })),
            "ping" => result_response(
                id,
                json!({
                    "status": "ok",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }),
            ),
            other => self.error_response(
                id,
                wire::METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
                None,
            ),
        }
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => {
                debug!("client initialization complete");
                self.client_ready.store(true, Ordering::Release);
            }
            other => {
                warn!(method = %other, "unknown notification dropped");
            }
        }
    }

    fn handle_initialize(&self, id: Value, params: &Value) -> Value {
        let requested = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();

        // Graceful downgrade: an unknown version is answered with ours.
        let negotiated = if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
            requested
        } else {
            DEFAULT_PROTOCOL_VERSION
        };
        *self
            .negotiated_version
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = negotiated.to_string();

        if let Some(client) = params.get("clientInfo") {
            debug!(client = %client, version = %negotiated, "initialize");
        }

        result_response(
            id,
            json!({
                "protocolVersion": negotiated,
                "capabilities": {
                    "tools": {},
                    "logging": {},
                },
                "serverInfo": {
                    "name": self.server_name,
                    "version": self.server_version,
                },
            }),
        )
    }

    async fn handle_tools_call(&self, id: Value, params: &Value) -> Value {
        let Some(params_obj) = params.as_object() else {
            return self.error_response(
                id,
                wire::INVALID_PARAMS,
                "invalid params: expected an object",
                None,
            );
        };

        let name = match params_obj.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return self.error_response(
                    id,
                    wire::INVALID_PARAMS,
                    "invalid params: 'name' must be a non-empty string",
                    None,
                );
            }
        };

        let arguments = match params_obj.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(_) => {
                return self.error_response(
                    id,
                    wire::INVALID_PARAMS,
                    "invalid params: 'arguments' must be an object",
                    None,
                );
            }
        };

        let (key, task_id) = self.cache.begin(&name, &arguments);
        debug!(tool = %name, task = %task_id, "tools/call");

        match self.manager.call_tool(&name, Some(arguments)).await {
            Ok(result) => {
                let result = normalize_call_result(result);
                self.cache.complete(&key, result.clone());
                result_response(id, result)
            }
            Err(e) => {
                self.cache.fail(&key, e.to_string());
                let detail = if self.production {
                    None
                } else {
                    Some(format!("{e:?}"))
                };
                self.error_response(id, e.wire_code(), &e.to_string(), detail)
            }
        }
    }

    fn error_response(&self, id: Value, code: i64, message: &str, detail: Option<String>) -> Value {
        let mut error = json!({
            "code": code,
            "message": message,
        });
        // Stack data never leaves a production gateway.
        if !self.production
            && let Some(detail) = detail
        {
            error["data"] = json!({ "stack": detail });
        }
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": error,
        })
    }
}

fn result_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Guarantee the `{ content, isError }` result shape regardless of how the
/// backend serialized its reply.
fn normalize_call_result(result: Value) -> Value {
    match result {
        Value::Object(mut map) => {
            if !map.contains_key("content") {
                let text = Value::Object(map).to_string();
                return json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": false,
                });
            }
            map.entry("isError").or_insert(Value::Bool(false));
            Value::Object(map)
        }
        other => json!({
            "content": [{"type": "text", "text": other.to_string()}],
            "isError": false,
        }),
    }
}

/// True when a response envelope carries a parse/validation failure that
/// the HTTP surface must report as status 400.
pub fn is_rejection(response: &Value) -> bool {
    matches!(
        response
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(Value::as_i64),
        Some(code) if code == wire::PARSE_ERROR || code == wire::INVALID_REQUEST
    )
}
