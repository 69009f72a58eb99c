use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{BackendService, ConnectionState, RegistryRefresh, ServiceStatus};
use crate::config::{BackendServiceConfig, HandlerConfig, validate_service};
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::overlay::CustomToolOverlay;
use crate::registry::{RegistrySnapshot, ServiceTools, ToolDescriptor, ToolRegistry};
use crate::transport::{Transport, transport_for};

/// Owns the backend fleet: presents the unified catalogue and routes calls.
pub struct ServiceManager {
    services: DashMap<String, Arc<BackendService>>,
    configs: StdRwLock<HashMap<String, BackendServiceConfig>>,
    /// Configuration order; aggregation iterates it so collision resolution
    /// is deterministic.
    order: StdRwLock<Vec<String>>,
    registry: Arc<ToolRegistry>,
    overlay: Arc<CustomToolOverlay>,
    bus: Arc<EventBus>,
}

impl ServiceManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        overlay: Arc<CustomToolOverlay>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            configs: StdRwLock::new(HashMap::new()),
            order: StdRwLock::new(Vec::new()),
            registry,
            overlay,
            bus,
        })
    }

    /// Seed configs at startup. Names are ordered lexicographically so the
    /// aggregation order is stable across runs.
    pub fn load_configs(&self, configs: &HashMap<String, BackendServiceConfig>) {
        let mut names: Vec<String> = configs.keys().cloned().collect();
        names.sort();
        *self.order.write().unwrap_or_else(|e| e.into_inner()) = names;
        *self.configs.write().unwrap_or_else(|e| e.into_inner()) = configs.clone();
    }

    /// Add or replace a service config. A running service is stopped and
    /// restarted with the new config.
    pub async fn add_config(
        self: &Arc<Self>,
        name: &str,
        config: BackendServiceConfig,
    ) -> Result<(), GatewayError> {
        validate_service(name, &config).map_err(|reason| GatewayError::ConfigInvalid {
            service: name.to_string(),
            reason,
        })?;

        let was_running = self.services.contains_key(name);
        if was_running {
            warn!(service = %name, "replacing config of running service");
            self.shutdown_service(name, "config replaced").await;
        }

        {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
            if configs.insert(name.to_string(), config).is_none() {
                order.push(name.to_string());
            }
        }

        if was_running {
            self.start(name).await?;
        }
        Ok(())
    }

    /// Remove a service config: stops the service and drops its tools.
    pub async fn remove_config(self: &Arc<Self>, name: &str) {
        self.shutdown_service(name, "config removed").await;
        {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
            configs.remove(name);
            order.retain(|n| n != name);
        }
        self.refresh();
        info!(service = %name, "service config removed");
    }

    /// Start (connect) one configured service. Idempotent while connected.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<(), GatewayError> {
        if let Some(service) = self.services.get(name).map(|r| Arc::clone(r.value())) {
            return service.connect().await;
        }

        let config = self
            .configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::ConfigInvalid {
                service: name.to_string(),
                reason: "unknown service".to_string(),
            })?;

        let transport = transport_for(name, &config);
        let service = self.register_service(name, config, transport);
        service.connect().await
    }

    /// Stop (disconnect) one service, keeping it registered for later
    /// `start`. No-op when already disconnected.
    pub async fn stop(&self, name: &str) -> Result<(), GatewayError> {
        let service = self
            .services
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| GatewayError::ConfigInvalid {
                service: name.to_string(),
                reason: "unknown service".to_string(),
            })?;
        service.disconnect("stopped by operator").await;
        Ok(())
    }

    /// Start every configured service concurrently.
    pub async fn start_all(self: &Arc<Self>) {
        let names = self.order.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut join_set = tokio::task::JoinSet::new();

        for name in names {
            let manager = Arc::clone(self);
            join_set.spawn(async move {
                match manager.start(&name).await {
                    Ok(()) => info!(service = %name, "service started"),
                    Err(e) => error!(service = %name, error = %e, "failed to start service"),
                }
            });
        }

        while join_set.join_next().await.is_some() {}
        info!(services = self.services.len(), "service startup complete");
    }

    /// Disconnect every service in parallel, draining in-flight calls
    /// first so callers already inside `call_tool` finish cleanly instead
    /// of racing the closing transports.
    pub async fn stop_all(&self) {
        let services: Vec<Arc<BackendService>> = self
            .services
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();

        let in_flight: usize = services.iter().map(|s| s.in_flight_calls()).sum();
        if in_flight > 0 {
            info!(in_flight, "draining in-flight calls before shutdown");
            let drain_start = std::time::Instant::now();
            loop {
                let remaining: usize = services.iter().map(|s| s.in_flight_calls()).sum();
                if remaining == 0 {
                    info!(
                        elapsed_ms = drain_start.elapsed().as_millis() as u64,
                        "all in-flight calls drained"
                    );
                    break;
                }
                if drain_start.elapsed() > super::DRAIN_TIMEOUT {
                    warn!(
                        in_flight = remaining,
                        "drain timeout, forcing shutdown"
                    );
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }

        let mut join_set = tokio::task::JoinSet::new();
        for service in services {
            join_set.spawn(async move {
                service.disconnect("gateway shutdown").await;
            });
        }
        while join_set.join_next().await.is_some() {}

        self.services.clear();
        self.refresh();
        info!("all services stopped");
    }

    /// The aggregated catalogue. Lock-free snapshot read.
    pub fn list_all_tools(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    /// Rebuild the registry snapshot from the overlay plus every Connected
    /// service, in configuration order.
    pub fn refresh(&self) {
        struct Collected {
            name: String,
            tools: Vec<ToolDescriptor>,
            toggles: HashMap<String, bool>,
        }

        let overlay_entries = self.overlay.list();

        let collected: Vec<Collected> = {
            let order = self.order.read().unwrap_or_else(|e| e.into_inner());
            let configs = self.configs.read().unwrap_or_else(|e| e.into_inner());
            order
                .iter()
                .filter_map(|name| {
                    let service = self.services.get(name)?;
                    let tools = service.tools_if_connected()?;
                    let toggles = configs
                        .get(name)
                        .map(|c| {
                            c.tools
                                .iter()
                                .map(|(tool, t)| (tool.clone(), t.enable))
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(Collected {
                        name: name.clone(),
                        tools,
                        toggles,
                    })
                })
                .collect()
        };

        let closures: Vec<Box<dyn Fn(&str) -> bool>> = collected
            .iter()
            .map(|c| {
                let toggles = c.toggles.clone();
                Box::new(move |tool: &str| *toggles.get(tool).unwrap_or(&true))
                    as Box<dyn Fn(&str) -> bool>
            })
            .collect();

        let service_tools: Vec<ServiceTools<'_>> = collected
            .iter()
            .zip(closures.iter())
            .map(|(c, enabled)| ServiceTools {
                service_name: &c.name,
                tools: &c.tools,
                enabled: enabled.as_ref(),
            })
            .collect();

        let count = self.registry.rebuild(&overlay_entries, &service_tools);
        self.bus
            .publish(GatewayEvent::ToolRegistryChanged { tool_count: count });
    }

    /// Route a tool call: overlay first (custom wins), then the registry.
    ///
    /// Errors propagate unchanged, except that unknown names become
    /// `ToolNotFound`.
    pub async fn call_tool(&self, name: &str, args: Option<Value>) -> Result<Value, GatewayError> {
        if self.overlay.has(name) {
            if let Some(HandlerConfig::Mcp {
                service_name,
                tool_name,
            }) = self.overlay.handler(name)
            {
                // Rewrite to the underlying backend tool.
                let (service_name, tool_name) = (service_name.clone(), tool_name.clone());
                return self.call_backend(&service_name, &tool_name, args).await;
            }
            return self.overlay.call(name, args).await;
        }

        let snapshot = self.registry.snapshot();
        match snapshot.resolve(name) {
            Some((service_name, original_name)) => {
                let (service_name, original_name) =
                    (service_name.to_string(), original_name.to_string());
                self.call_backend(&service_name, &original_name, args).await
            }
            None => Err(GatewayError::ToolNotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn call_backend(
        &self,
        service_name: &str,
        tool_name: &str,
        args: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let service = self
            .services
            .get(service_name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| GatewayError::ToolNotFound {
                name: tool_name.to_string(),
            })?;
        service.call_tool(tool_name, args).await
    }

    /// Status of every configured service (registered or not yet started).
    pub fn get_status(&self) -> Vec<ServiceStatus> {
        let order = self.order.read().unwrap_or_else(|e| e.into_inner()).clone();
        order
            .iter()
            .map(|name| match self.services.get(name) {
                Some(service) => service.status(),
                None => ServiceStatus {
                    name: name.clone(),
                    state: ConnectionState::Disconnected,
                    tool_count: 0,
                    reconnect_attempts: 0,
                    consecutive_ping_failures: 0,
                    last_error: None,
                },
            })
            .collect()
    }

    pub fn service(&self, name: &str) -> Option<Arc<BackendService>> {
        self.services.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Register a service built on the given transport. Also used by tests
    /// to inject mock transports.
    pub(crate) fn register_service(
        self: &Arc<Self>,
        name: &str,
        config: BackendServiceConfig,
        transport: Box<dyn Transport>,
    ) -> Arc<BackendService> {
        {
            let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
            let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
            if configs.insert(name.to_string(), config.clone()).is_none() {
                order.push(name.to_string());
            }
        }

        let weak = Arc::downgrade(self);
        let refresh: RegistryRefresh = Arc::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.refresh();
            }
        });

        let service = BackendService::new(
            name.to_string(),
            config,
            transport,
            Arc::clone(&self.bus),
            refresh,
        );
        self.services.insert(name.to_string(), Arc::clone(&service));
        service
    }

    /// Stop a service and drop it from the fleet.
    async fn shutdown_service(&self, name: &str, reason: &str) {
        if let Some((_, service)) = self.services.remove(name) {
            service.disconnect(reason).await;
        }
    }
}
