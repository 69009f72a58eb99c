pub mod backoff;
pub mod manager;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendServiceConfig;
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent, epoch_millis};
use crate::registry::ToolDescriptor;
use crate::transport::{Channel, Transport};

/// Connection lifecycle of one backend service.
///
/// Transitions happen only inside `BackendService`, under its state mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    Failed,
}

/// Point-in-time view of a service, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub reconnect_attempts: u32,
    pub consecutive_ping_failures: u32,
    pub last_error: Option<String>,
}

/// Hook the manager installs so state changes refresh the registry snapshot.
pub type RegistryRefresh = Arc<dyn Fn() + Send + Sync>;

/// Maximum time to wait for in-flight calls to settle during a disconnect
/// or fleet shutdown.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// RAII guard that tracks in-flight calls for graceful drain on disconnect.
struct CallGuard(Arc<AtomicUsize>);

impl CallGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    state: ConnectionState,
    reconnect_attempts: u32,
    ping_failures: u32,
    last_error: Option<String>,
    /// Cancels the ping loop, close watcher, and any scheduled reconnect of
    /// the current lifecycle.
    cancel: CancellationToken,
}

/// One backend service: owns its transport, runs the connection state
/// machine, probes liveness, and reconnects with backoff.
///
/// The state mutex is a plain `std` mutex and is never held across an await;
/// racing triggers (transport close + ping timeout in the same instant)
/// collapse into a single transition via the generation counter.
pub struct BackendService {
    name: String,
    config: BackendServiceConfig,
    transport: Box<dyn Transport>,
    inner: StdMutex<Inner>,
    /// Bumped on every transition out of or into a live lifecycle; spawned
    /// tasks carry the generation they were born in and stand down on
    /// mismatch.
    generation: AtomicU64,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    /// Tool list cache. Preserved on disconnect for observability; the
    /// registry only aggregates it while `Connected`.
    tools: StdRwLock<Vec<ToolDescriptor>>,
    in_flight_calls: Arc<AtomicUsize>,
    bus: Arc<EventBus>,
    registry_refresh: RegistryRefresh,
}

impl BackendService {
    pub fn new(
        name: String,
        config: BackendServiceConfig,
        transport: Box<dyn Transport>,
        bus: Arc<EventBus>,
        registry_refresh: RegistryRefresh,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            transport,
            inner: StdMutex::new(Inner {
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                ping_failures: 0,
                last_error: None,
                cancel: CancellationToken::new(),
            }),
            generation: AtomicU64::new(0),
            channel: RwLock::new(None),
            tools: StdRwLock::new(Vec::new()),
            in_flight_calls: Arc::new(AtomicUsize::new(0)),
            bus,
            registry_refresh,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BackendServiceConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    /// Cached tool list (last successful discovery, any state).
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Tool list for aggregation: non-empty view only while `Connected`.
    pub fn tools_if_connected(&self) -> Option<Vec<ToolDescriptor>> {
        if self.state() == ConnectionState::Connected {
            Some(self.tools())
        } else {
            None
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let inner = self.lock_inner();
        ServiceStatus {
            name: self.name.clone(),
            state: inner.state,
            tool_count: self.tools.read().unwrap_or_else(|e| e.into_inner()).len(),
            reconnect_attempts: inner.reconnect_attempts,
            consecutive_ping_failures: inner.ping_failures,
            last_error: inner.last_error.clone(),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect and perform the MCP handshake + initial tools/list.
    ///
    /// Idempotent while `Connected`. On a handshake/transport/timeout
    /// failure the error is surfaced AND a reconnect is scheduled when the
    /// policy allows it.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        let (generation, token) = {
            let mut inner = self.lock_inner();
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting
                | ConnectionState::Reconnecting
                | ConnectionState::Disconnecting => {
                    return Err(GatewayError::AlreadyConnecting {
                        service: self.name.clone(),
                    });
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {}
            }
            inner.state = ConnectionState::Connecting;
            inner.reconnect_attempts = 0;
            inner.ping_failures = 0;
            inner.cancel = CancellationToken::new();
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            (generation, inner.cancel.clone())
        };

        match self.try_connect_once(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_error(&e);
                self.bus.publish(GatewayEvent::ServiceConnectionFailed {
                    service_name: self.name.clone(),
                    attempt: 0,
                    error: e.to_string(),
                });
                if e.triggers_reconnect() && self.config.reconnect.enabled {
                    self.enter_reconnecting(generation, token);
                } else {
                    let mut inner = self.lock_inner();
                    if inner.state == ConnectionState::Connecting {
                        inner.state = ConnectionState::Disconnected;
                    }
                }
                Err(e)
            }
        }
    }

    /// Disconnect and suppress any scheduled reconnect. No-op while
    /// `Disconnected`.
    pub async fn disconnect(self: &Arc<Self>, reason: &str) {
        {
            let mut inner = self.lock_inner();
            match inner.state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
                _ => {}
            }
            inner.state = ConnectionState::Disconnecting;
            inner.cancel.cancel();
            self.generation.fetch_add(1, Ordering::AcqRel);
        }

        // The cancellation above resolves pending callers with `Cancelled`;
        // wait for their guards to drop before the channel goes away.
        self.drain_in_flight(DRAIN_TIMEOUT).await;

        if let Some(channel) = self.channel.write().await.take() {
            channel.close().await;
        }

        // Tools leave the snapshot before the disconnect event goes out.
        (self.registry_refresh)();

        {
            let mut inner = self.lock_inner();
            inner.state = ConnectionState::Disconnected;
            inner.cancel = CancellationToken::new();
        }

        info!(service = %self.name, reason = %reason, "service disconnected");
        self.bus.publish(GatewayEvent::ServiceDisconnected {
            service_name: self.name.clone(),
            reason: reason.to_string(),
            disconnection_time_ms: epoch_millis(),
        });
    }

    /// Forward a tool call over the open channel, gated by `call_timeout`.
    ///
    /// Races the lifecycle cancellation token so an explicit `disconnect`
    /// (config removal, shutdown) resolves pending callers with `Cancelled`
    /// instead of leaving them to fight the closing transport.
    pub async fn call_tool(&self, tool: &str, args: Option<Value>) -> Result<Value, GatewayError> {
        let token = {
            let inner = self.lock_inner();
            if inner.state != ConnectionState::Connected {
                return Err(GatewayError::NotConnected {
                    service: self.name.clone(),
                });
            }
            inner.cancel.clone()
        };

        let known = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.name == tool);
        if !known {
            return Err(GatewayError::ToolNotFound {
                name: tool.to_string(),
            });
        }

        let channel = {
            let guard = self.channel.read().await;
            guard.clone().ok_or_else(|| GatewayError::NotConnected {
                service: self.name.clone(),
            })?
        };

        let _guard = CallGuard::new(&self.in_flight_calls);

        tokio::select! {
            _ = token.cancelled() => Err(GatewayError::Cancelled {
                operation: format!("tool call '{tool}' on service '{}'", self.name),
            }),
            result = channel.call_tool(tool, args, self.config.call_timeout) => result,
        }
    }

    /// Number of tool calls currently in flight.
    pub fn in_flight_calls(&self) -> usize {
        self.in_flight_calls.load(Ordering::SeqCst)
    }

    /// Wait until in-flight calls have settled, up to `timeout`. Called
    /// after the lifecycle token is cancelled, so pending callers resolve
    /// with `Cancelled` and their guards drop promptly.
    async fn drain_in_flight(&self, timeout: Duration) {
        let in_flight = self.in_flight_calls.load(Ordering::SeqCst);
        if in_flight == 0 {
            return;
        }

        info!(service = %self.name, in_flight, "draining in-flight calls");
        let drain_start = Instant::now();
        loop {
            let remaining = self.in_flight_calls.load(Ordering::SeqCst);
            if remaining == 0 {
                debug!(
                    service = %self.name,
                    elapsed_ms = drain_start.elapsed().as_millis() as u64,
                    "all in-flight calls drained"
                );
                return;
            }
            if drain_start.elapsed() > timeout {
                warn!(
                    service = %self.name,
                    in_flight = remaining,
                    "drain timeout, forcing channel close"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // --- Lifecycle internals ---

    /// One connect attempt: transport open, handshake, initial tools/list,
    /// all under `per_attempt_timeout`. On success the service enters
    /// `Connected`, publishes the event, refreshes the registry, and spawns
    /// the ping loop + close watcher.
    async fn try_connect_once(self: &Arc<Self>, generation: u64) -> Result<(), GatewayError> {
        let started = Instant::now();
        let deadline = self.config.reconnect.per_attempt_timeout;

        let attempt = async {
            let channel = self.transport.connect().await?;
            let tools = channel.list_tools().await?;
            Ok::<_, GatewayError>((channel, tools))
        };

        let (channel, tools) = tokio::time::timeout(deadline, attempt)
            .await
            .map_err(|_| GatewayError::Timeout {
                operation: format!("connect to service '{}'", self.name),
                millis: deadline.as_millis() as u64,
            })??;

        let channel: Arc<dyn Channel> = Arc::from(channel);
        *self.channel.write().await = Some(Arc::clone(&channel));

        let token = {
            let mut inner = self.lock_inner();
            let stale = self.generation.load(Ordering::Acquire) != generation
                || !matches!(
                    inner.state,
                    ConnectionState::Connecting | ConnectionState::Reconnecting
                );
            if stale {
                None
            } else {
                inner.state = ConnectionState::Connected;
                inner.ping_failures = 0;
                inner.last_error = None;
                Some(inner.cancel.clone())
            }
        };
        let token = match token {
            Some(token) => token,
            None => {
                self.channel.write().await.take();
                channel.close().await;
                return Err(GatewayError::Cancelled {
                    operation: format!("connect to service '{}'", self.name),
                });
            }
        };

        let tool_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = tools;

        info!(
            service = %self.name,
            tools = tool_names.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "service connected"
        );

        // Event first, then the registry refresh: `service:connected` is
        // observable before any tool becomes discoverable.
        self.bus.publish(GatewayEvent::ServiceConnected {
            service_name: self.name.clone(),
            tools: tool_names,
            connection_time_ms: epoch_millis(),
        });
        (self.registry_refresh)();

        self.spawn_close_watcher(generation, token.clone(), Arc::clone(&channel));
        if self.config.ping.enabled {
            self.spawn_ping_loop(generation, token, channel);
        }

        Ok(())
    }

    /// React to an unexpected loss of `Connected`. Only the first trigger of
    /// a generation acts; the rest observe the bumped generation and stand
    /// down.
    async fn handle_connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let token = {
            let mut inner = self.lock_inner();
            if self.generation.load(Ordering::Acquire) != generation
                || inner.state != ConnectionState::Connected
            {
                return;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();
            inner.state = if self.config.reconnect.enabled {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            inner.last_error = Some(reason.to_string());
            inner.cancel.clone()
        };

        warn!(service = %self.name, reason = %reason, "connection lost");

        // Callers racing the dead connection were resolved by the token
        // cancellation above.
        self.drain_in_flight(DRAIN_TIMEOUT).await;

        if let Some(channel) = self.channel.write().await.take() {
            channel.close().await;
        }

        (self.registry_refresh)();
        self.bus.publish(GatewayEvent::ServiceDisconnected {
            service_name: self.name.clone(),
            reason: reason.to_string(),
            disconnection_time_ms: epoch_millis(),
        });

        if self.config.reconnect.enabled {
            let generation = self.generation.load(Ordering::Acquire);
            self.spawn_reconnect_loop(generation, token);
        }
    }

    /// Move a failed connect into `Reconnecting` and schedule attempts.
    fn enter_reconnecting(self: &Arc<Self>, generation: u64, token: CancellationToken) {
        {
            let mut inner = self.lock_inner();
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            inner.state = ConnectionState::Reconnecting;
        }
        self.spawn_reconnect_loop(generation, token);
    }

    fn spawn_reconnect_loop(self: &Arc<Self>, generation: u64, token: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.reconnect_loop(generation, token).await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            if backoff::exhausted(&policy, attempt) {
                let mut inner = self.lock_inner();
                if self.generation.load(Ordering::Acquire) == generation
                    && inner.state == ConnectionState::Reconnecting
                {
                    inner.state = ConnectionState::Failed;
                    warn!(
                        service = %self.name,
                        attempts = attempt,
                        "reconnect attempts exhausted, service failed"
                    );
                }
                return;
            }

            attempt += 1;
            let wait = backoff::delay(&policy, attempt);
            debug!(
                service = %self.name,
                attempt,
                delay_ms = wait.as_millis() as u64,
                "scheduling reconnect attempt"
            );

            tokio::select! {
                _ = token.cancelled() => {
                    debug!(service = %self.name, "reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            {
                let mut inner = self.lock_inner();
                if self.generation.load(Ordering::Acquire) != generation
                    || inner.state != ConnectionState::Reconnecting
                {
                    return;
                }
                inner.reconnect_attempts = attempt;
            }

            match self.try_connect_once(generation).await {
                Ok(()) => {
                    info!(service = %self.name, attempt, "reconnected");
                    return;
                }
                Err(e) => {
                    self.record_error(&e);
                    warn!(service = %self.name, attempt, error = %e, "reconnect attempt failed");
                    self.bus.publish(GatewayEvent::ServiceConnectionFailed {
                        service_name: self.name.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn spawn_ping_loop(
        self: &Arc<Self>,
        generation: u64,
        token: CancellationToken,
        channel: Arc<dyn Channel>,
    ) {
        let service = Arc::clone(self);
        let policy = self.config.ping.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(policy.start_delay) => {}
            }

            // Sequential by construction: at most one probe in flight.
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(policy.interval) => {}
                }

                let result = channel.ping(policy.per_ping_timeout).await;

                let failures = {
                    let mut inner = service.lock_inner();
                    if service.generation.load(Ordering::Acquire) != generation
                        || inner.state != ConnectionState::Connected
                    {
                        return;
                    }
                    match &result {
                        Ok(()) => {
                            if inner.ping_failures > 0 {
                                info!(service = %service.name, "ping recovered");
                            }
                            inner.ping_failures = 0;
                            0
                        }
                        Err(e) => {
                            inner.ping_failures += 1;
                            warn!(
                                service = %service.name,
                                failures = inner.ping_failures,
                                error = %e,
                                "ping failed"
                            );
                            inner.ping_failures
                        }
                    }
                };

                if result.is_err() && failures >= policy.max_consecutive_failures {
                    service
                        .handle_connection_lost(
                            generation,
                            &format!("{failures} consecutive ping failures"),
                        )
                        .await;
                    return;
                }
            }
        });
    }

    fn spawn_close_watcher(
        self: &Arc<Self>,
        generation: u64,
        token: CancellationToken,
        channel: Arc<dyn Channel>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = token.cancelled() => return,
                reason = channel.wait_closed() => reason,
            };
            service.handle_connection_lost(generation, &reason).await;
        });
    }

    fn record_error(&self, error: &GatewayError) {
        self.lock_inner().last_error = Some(error.to_string());
    }
}
