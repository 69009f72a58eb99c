//! Test utilities: a controllable mock transport/channel pair.
//!
//! Only compiled under `#[cfg(test)]`. The mock implements the `Transport`
//! and `Channel` traits directly, so the connection state machine, ping
//! loop, manager routing, and protocol surface can be tested without real
//! child processes or network connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::config::{
    BackendServiceConfig, PingPolicy, ReconnectPolicy, TransportKind,
};
use crate::error::GatewayError;
use crate::registry::ToolDescriptor;
use crate::transport::{Channel, Transport};

/// A stdio-shaped config for tests (the mock transport ignores it).
pub fn test_config() -> BackendServiceConfig {
    BackendServiceConfig {
        transport: TransportKind::Stdio,
        command: Some("mock".to_string()),
        args: Vec::new(),
        env: HashMap::new(),
        cwd: None,
        url: None,
        headers: HashMap::new(),
        api_key: None,
        call_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy::default(),
        ping: PingPolicy {
            enabled: false,
            ..PingPolicy::default()
        },
        tools: HashMap::new(),
    }
}

/// Shared observable state for every channel a [`MockTransport`] hands out.
pub struct MockState {
    fail_pings: AtomicBool,
    fail_calls: AtomicBool,
    ping_delay: StdMutex<Duration>,
    call_delay: StdMutex<Duration>,
    in_flight_pings: AtomicUsize,
    max_in_flight_pings: AtomicUsize,
    closed_count: AtomicUsize,
    close_reason: StdMutex<Option<String>>,
    close_notify: Notify,
    call_log: StdMutex<Vec<(String, Option<Value>)>>,
    call_results: StdMutex<HashMap<String, Value>>,
}

impl MockState {
    pub fn fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }

    /// Per-call delay, for holding calls in flight during drain tests.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    pub fn max_concurrent_pings(&self) -> usize {
        self.max_in_flight_pings.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed_count.load(Ordering::SeqCst) > 0
    }

    /// Simulate the transport closing on its own; consumed by the first
    /// `wait_closed` waiter.
    pub fn trigger_close(&self, reason: &str) {
        *self.close_reason.lock().unwrap() = Some(reason.to_string());
        self.close_notify.notify_waiters();
    }

    /// Fixed result for a tool; defaults to an ok text result otherwise.
    pub fn set_call_result(&self, tool: &str, result: Value) {
        self.call_results
            .lock()
            .unwrap()
            .insert(tool.to_string(), result);
    }

    pub fn call_log(&self) -> Vec<(String, Option<Value>)> {
        self.call_log.lock().unwrap().clone()
    }
}

/// RAII guard keeping the in-flight ping counter accurate under
/// cancellation.
struct PingGuard<'a>(&'a MockState);

impl Drop for PingGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight_pings.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable transport: connect failures, connect delay, shared channel
/// state.
pub struct MockTransport {
    tools: Vec<ToolDescriptor>,
    connect_count: Arc<AtomicU32>,
    fail_connects: Arc<AtomicU32>,
    connect_delay: Arc<StdMutex<Duration>>,
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(tool_names: &[&str]) -> Self {
        let tools = tool_names
            .iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                description: format!("{name} (mock)"),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect();
        Self {
            tools,
            connect_count: Arc::new(AtomicU32::new(0)),
            fail_connects: Arc::new(AtomicU32::new(0)),
            connect_delay: Arc::new(StdMutex::new(Duration::ZERO)),
            state: Arc::new(MockState {
                fail_pings: AtomicBool::new(false),
                fail_calls: AtomicBool::new(false),
                ping_delay: StdMutex::new(Duration::ZERO),
                call_delay: StdMutex::new(Duration::ZERO),
                in_flight_pings: AtomicUsize::new(0),
                max_in_flight_pings: AtomicUsize::new(0),
                closed_count: AtomicUsize::new(0),
                close_reason: StdMutex::new(None),
                close_notify: Notify::new(),
                call_log: StdMutex::new(Vec::new()),
                call_results: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Counter of `connect` calls, usable after the transport is boxed.
    pub fn connect_count(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.connect_count)
    }

    /// Shared channel state, usable after the transport is boxed.
    pub fn ping_state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, GatewayError> {
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.connect_count.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(GatewayError::Transport {
                service: "mock".to_string(),
                reason: "injected connect failure".to_string(),
            });
        }

        Ok(Box::new(MockChannel {
            tools: self.tools.clone(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MockChannel {
    tools: Vec<ToolDescriptor>,
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MockChannel {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed {
                service: "mock".to_string(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Option<Value>,
        _timeout: Duration,
    ) -> Result<Value, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed {
                service: "mock".to_string(),
            });
        }

        self.state
            .call_log
            .lock()
            .unwrap()
            .push((tool.to_string(), args));

        if self.state.fail_calls.load(Ordering::SeqCst) {
            return Err(GatewayError::ToolExecution {
                tool: tool.to_string(),
                reason: "injected call failure".to_string(),
            });
        }

        let delay = *self.state.call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(result) = self.state.call_results.lock().unwrap().get(tool) {
            return Ok(result.clone());
        }

        Ok(json!({
            "content": [{"type": "text", "text": "ok"}],
            "isError": false
        }))
    }

    async fn ping(&self, timeout: Duration) -> Result<(), GatewayError> {
        let current = self.state.in_flight_pings.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_in_flight_pings
            .fetch_max(current, Ordering::SeqCst);
        let _guard = PingGuard(&self.state);

        let delay = *self.state.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if delay > timeout {
            return Err(GatewayError::Timeout {
                operation: "mock ping".to_string(),
                millis: timeout.as_millis() as u64,
            });
        }

        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport {
                service: "mock".to_string(),
                reason: "injected ping failure".to_string(),
            });
        }

        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.closed_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn wait_closed(&self) -> String {
        loop {
            // Register interest before checking, so a trigger racing the
            // check is not lost.
            let notified = self.state.close_notify.notified();
            if let Some(reason) = self.state.close_reason.lock().unwrap().take() {
                return reason;
            }
            notified.await;
        }
    }
}
