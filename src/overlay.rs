use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{CustomToolConfig, HandlerConfig, PlatformConfig};
use crate::error::GatewayError;
use crate::registry::{AggregatedTool, CUSTOM_SERVICE_NAME};

/// Default deadline for proxy-handler calls.
const PROXY_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Platform-specific outbound caller for `proxy` handlers. The actual
/// forwarding machinery lives outside the core.
#[async_trait]
pub trait ProxyRunner: Send + Sync {
    async fn run(
        &self,
        platform: &str,
        config: &HashMap<String, Value>,
        token: &str,
        args: &Value,
    ) -> Result<Value, GatewayError>;
}

/// Sandbox runner for `function` handlers. The sandbox itself is outside
/// the core; tests install a stub.
#[async_trait]
pub trait FunctionRunner: Send + Sync {
    async fn run(
        &self,
        code: &str,
        entrypoint: &str,
        args: &Value,
    ) -> Result<Value, GatewayError>;
}

/// Default runner used when no platform caller has been installed.
struct UnconfiguredProxyRunner;

#[async_trait]
impl ProxyRunner for UnconfiguredProxyRunner {
    async fn run(
        &self,
        platform: &str,
        _config: &HashMap<String, Value>,
        _token: &str,
        _args: &Value,
    ) -> Result<Value, GatewayError> {
        Err(GatewayError::ToolExecution {
            tool: String::new(),
            reason: format!("no runner installed for platform '{platform}'"),
        })
    }
}

struct UnconfiguredFunctionRunner;

#[async_trait]
impl FunctionRunner for UnconfiguredFunctionRunner {
    async fn run(
        &self,
        _code: &str,
        _entrypoint: &str,
        _args: &Value,
    ) -> Result<Value, GatewayError> {
        Err(GatewayError::ToolExecution {
            tool: String::new(),
            reason: "function sandbox unavailable".to_string(),
        })
    }
}

struct CustomTool {
    config: CustomToolConfig,
    validator: Option<jsonschema::Validator>,
}

/// Locally declared tools that shadow or augment backend tools.
///
/// Entries keep their declared names in the aggregated catalogue and always
/// win name collisions against backend tools.
pub struct CustomToolOverlay {
    tools: Vec<CustomTool>,
    by_name: HashMap<String, usize>,
    platforms: PlatformConfig,
    http: reqwest::Client,
    proxy_runner: Box<dyn ProxyRunner>,
    function_runner: Box<dyn FunctionRunner>,
}

impl CustomToolOverlay {
    pub fn empty() -> Arc<Self> {
        Self::load_from_config(&[], PlatformConfig::default()).expect("empty overlay")
    }

    pub fn load_from_config(
        tools: &[CustomToolConfig],
        platforms: PlatformConfig,
    ) -> Result<Arc<Self>, GatewayError> {
        Self::with_runners(
            tools,
            platforms,
            Box::new(UnconfiguredProxyRunner),
            Box::new(UnconfiguredFunctionRunner),
        )
    }

    pub fn with_runners(
        tools: &[CustomToolConfig],
        platforms: PlatformConfig,
        proxy_runner: Box<dyn ProxyRunner>,
        function_runner: Box<dyn FunctionRunner>,
    ) -> Result<Arc<Self>, GatewayError> {
        let mut entries = Vec::new();
        let mut by_name = HashMap::new();

        for config in tools {
            if by_name.contains_key(&config.name) {
                warn!(tool = %config.name, "duplicate custom tool, keeping first");
                continue;
            }

            let validator = if config.input_schema.is_null() {
                None
            } else {
                Some(jsonschema::validator_for(&config.input_schema).map_err(|e| {
                    GatewayError::ConfigInvalid {
                        service: CUSTOM_SERVICE_NAME.to_string(),
                        reason: format!("tool '{}': invalid input schema: {e}", config.name),
                    }
                })?)
            };

            by_name.insert(config.name.clone(), entries.len());
            entries.push(CustomTool {
                config: config.clone(),
                validator,
            });
        }

        Ok(Arc::new(Self {
            tools: entries,
            by_name,
            platforms,
            http: reqwest::Client::new(),
            proxy_runner,
            function_runner,
        }))
    }

    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerConfig> {
        self.get(name).map(|t| &t.handler)
    }

    pub fn get(&self, name: &str) -> Option<&CustomToolConfig> {
        self.by_name.get(name).map(|&i| &self.tools[i].config)
    }

    /// Entries in catalogue form, in declaration order.
    pub fn list(&self) -> Vec<AggregatedTool> {
        self.tools
            .iter()
            .map(|t| AggregatedTool {
                name: t.config.name.clone(),
                service_name: CUSTOM_SERVICE_NAME.to_string(),
                original_name: t.config.name.clone(),
                description: t.config.description.clone(),
                input_schema: t.config.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch a custom tool call.
    ///
    /// `mcp`-handler tools never execute here; the manager rewrites them to
    /// the owning backend before dispatch.
    pub async fn call(&self, name: &str, args: Option<Value>) -> Result<Value, GatewayError> {
        let tool = self
            .by_name
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| GatewayError::ToolNotFound {
                name: name.to_string(),
            })?;

        let args = args.unwrap_or_else(|| json!({}));
        self.validate_args(tool, &args)?;

        match &tool.config.handler {
            HandlerConfig::Proxy { platform, config } => {
                self.call_proxy(name, platform, config, &args).await
            }
            HandlerConfig::Http {
                url,
                method,
                headers,
                body_template,
            } => {
                self.call_http(name, url, method, headers, body_template.as_deref(), &args)
                    .await
            }
            HandlerConfig::Function { code, entrypoint } => {
                let result = self
                    .function_runner
                    .run(code, entrypoint, &args)
                    .await
                    .map_err(|e| GatewayError::ToolExecution {
                        tool: name.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(wrap_text_result(&result))
            }
            HandlerConfig::Mcp { .. } => Err(GatewayError::Internal(format!(
                "mcp-handler tool '{name}' dispatched through overlay"
            ))),
        }
    }

    /// Validate args against the tool's input schema. Failures carry the
    /// instance path and reason; stack traces never cross the wire.
    fn validate_args(&self, tool: &CustomTool, args: &Value) -> Result<(), GatewayError> {
        let Some(validator) = &tool.validator else {
            return Ok(());
        };
        if let Some(error) = validator.iter_errors(args).next() {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() { "/".to_string() } else { path };
            return Err(GatewayError::InvalidArguments {
                tool: tool.config.name.clone(),
                reason: format!("{path}: {error}"),
            });
        }
        Ok(())
    }

    async fn call_proxy(
        &self,
        name: &str,
        platform: &str,
        config: &HashMap<String, Value>,
        args: &Value,
    ) -> Result<Value, GatewayError> {
        let token = match platform {
            "coze" => self.platforms.coze_token.as_deref().ok_or_else(|| {
                GatewayError::ConfigInvalid {
                    service: CUSTOM_SERVICE_NAME.to_string(),
                    reason: format!("tool '{name}': coze platform token not configured"),
                }
            })?,
            _ => "",
        };

        debug!(tool = %name, platform = %platform, "dispatching proxy tool");

        let result = tokio::time::timeout(
            PROXY_CALL_TIMEOUT,
            self.proxy_runner.run(platform, config, token, args),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            operation: format!("proxy tool '{name}'"),
            millis: PROXY_CALL_TIMEOUT.as_millis() as u64,
        })?
        .map_err(|e| match e {
            err @ GatewayError::ConfigInvalid { .. } => err,
            err => GatewayError::ToolExecution {
                tool: name.to_string(),
                reason: err.to_string(),
            },
        })?;

        Ok(wrap_text_result(&result))
    }

    async fn call_http(
        &self,
        name: &str,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body_template: Option<&str>,
        args: &Value,
    ) -> Result<Value, GatewayError> {
        let method = method
            .parse::<reqwest::Method>()
            .map_err(|_| GatewayError::ConfigInvalid {
                service: CUSTOM_SERVICE_NAME.to_string(),
                reason: format!("tool '{name}': invalid HTTP method '{method}'"),
            })?;

        let body = match body_template {
            Some(template) => render_template(template, args),
            None => args.to_string(),
        };

        debug!(tool = %name, url = %url, "dispatching http tool");

        let mut request = self
            .http
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| GatewayError::ToolExecution {
            tool: name.to_string(),
            reason: format!("request failed: {e}"),
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(GatewayError::ToolExecution {
                tool: name.to_string(),
                reason: format!("upstream returned {status}: {}", truncate(&text, 200)),
            });
        }

        let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(wrap_text_result(&value))
    }
}

/// Wrap a raw handler result in the MCP tool-result shape.
pub fn wrap_text_result(value: &Value) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": false
    })
}

/// Substitute `{{key}}` placeholders with values from the argument object.
fn render_template(template: &str, args: &Value) -> String {
    let mut out = template.to_string();
    if let Some(map) = args.as_object() {
        for (key, value) in map {
            let needle = format!("{{{{{key}}}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &replacement);
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, handler: HandlerConfig) -> CustomToolConfig {
        CustomToolConfig {
            name: name.to_string(),
            description: format!("{name} custom tool"),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string"}
                },
                "required": ["expression"]
            }),
            handler,
        }
    }

    fn mcp_handler() -> HandlerConfig {
        HandlerConfig::Mcp {
            service_name: "svc".to_string(),
            tool_name: "calculator".to_string(),
        }
    }

    struct EchoFunctionRunner;

    #[async_trait]
    impl FunctionRunner for EchoFunctionRunner {
        async fn run(
            &self,
            _code: &str,
            entrypoint: &str,
            args: &Value,
        ) -> Result<Value, GatewayError> {
            Ok(json!({"entrypoint": entrypoint, "args": args}))
        }
    }

    struct EchoProxyRunner;

    #[async_trait]
    impl ProxyRunner for EchoProxyRunner {
        async fn run(
            &self,
            platform: &str,
            _config: &HashMap<String, Value>,
            token: &str,
            _args: &Value,
        ) -> Result<Value, GatewayError> {
            Ok(json!({"platform": platform, "token_present": !token.is_empty()}))
        }
    }

    #[test]
    fn test_list_and_lookup() {
        let overlay =
            CustomToolOverlay::load_from_config(&[tool("calc", mcp_handler())], PlatformConfig::default())
                .unwrap();

        assert!(overlay.has("calc"));
        assert!(!overlay.has("other"));

        let entries = overlay.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "calc");
        assert_eq!(entries[0].service_name, CUSTOM_SERVICE_NAME);
    }

    #[tokio::test]
    async fn test_schema_validation_rejects_bad_args() {
        let overlay = CustomToolOverlay::with_runners(
            &[tool("calc", HandlerConfig::Function {
                code: "x".to_string(),
                entrypoint: "main".to_string(),
            })],
            PlatformConfig::default(),
            Box::new(UnconfiguredProxyRunner),
            Box::new(EchoFunctionRunner),
        )
        .unwrap();

        // Missing required field.
        let err = overlay.call("calc", Some(json!({}))).await.unwrap_err();
        match &err {
            GatewayError::InvalidArguments { tool, reason } => {
                assert_eq!(tool, "calc");
                assert!(reason.contains("expression"), "reason: {reason}");
                // No internals leak.
                assert!(!reason.contains("src/"));
            }
            other => panic!("expected InvalidArguments, got {other:?}"),
        }

        // Wrong type.
        let err = overlay
            .call("calc", Some(json!({"expression": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_function_handler_roundtrip() {
        let overlay = CustomToolOverlay::with_runners(
            &[tool("calc", HandlerConfig::Function {
                code: "return 2".to_string(),
                entrypoint: "main".to_string(),
            })],
            PlatformConfig::default(),
            Box::new(UnconfiguredProxyRunner),
            Box::new(EchoFunctionRunner),
        )
        .unwrap();

        let result = overlay
            .call("calc", Some(json!({"expression": "1+1"})))
            .await
            .unwrap();
        assert_eq!(result["isError"], false);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("main"));
    }

    #[tokio::test]
    async fn test_proxy_requires_coze_token() {
        let proxy = HandlerConfig::Proxy {
            platform: "coze".to_string(),
            config: HashMap::new(),
        };

        // Without token: ConfigInvalid.
        let overlay = CustomToolOverlay::with_runners(
            &[tool("wf", proxy.clone())],
            PlatformConfig::default(),
            Box::new(EchoProxyRunner),
            Box::new(UnconfiguredFunctionRunner),
        )
        .unwrap();
        let err = overlay
            .call("wf", Some(json!({"expression": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigInvalid { .. }));

        // With token: the runner sees it.
        let overlay = CustomToolOverlay::with_runners(
            &[tool("wf", proxy)],
            PlatformConfig {
                coze_token: Some("secret".to_string()),
            },
            Box::new(EchoProxyRunner),
            Box::new(UnconfiguredFunctionRunner),
        )
        .unwrap();
        let result = overlay
            .call("wf", Some(json!({"expression": "x"})))
            .await
            .unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("token_present\":true"));
    }

    #[tokio::test]
    async fn test_mcp_handler_never_executes_in_overlay() {
        let overlay =
            CustomToolOverlay::load_from_config(&[tool("calc", mcp_handler())], PlatformConfig::default())
                .unwrap();
        let err = overlay
            .call("calc", Some(json!({"expression": "1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let overlay = CustomToolOverlay::empty();
        let err = overlay.call("nope", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound { .. }));
    }

    #[test]
    fn test_invalid_schema_rejected_at_load() {
        let mut bad = tool("calc", mcp_handler());
        bad.input_schema = json!({"type": "not-a-type"});
        let result = CustomToolOverlay::load_from_config(&[bad], PlatformConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_render_template() {
        let args = json!({"city": "Berlin", "days": 3});
        assert_eq!(
            render_template(r#"{"q":"{{city}}","n":{{days}}}"#, &args),
            r#"{"q":"Berlin","n":3}"#
        );
        // Unknown placeholders stay as-is.
        assert_eq!(render_template("{{missing}}", &args), "{{missing}}");
    }

    #[test]
    fn test_wrap_text_result() {
        let wrapped = wrap_text_result(&json!("plain"));
        assert_eq!(wrapped["content"][0]["text"], "plain");
        let wrapped = wrap_text_result(&json!({"a": 1}));
        assert_eq!(wrapped["content"][0]["text"], "{\"a\":1}");
        assert_eq!(wrapped["isError"], false);
    }
}
