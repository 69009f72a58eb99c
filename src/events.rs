use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

/// Lifecycle events announced to non-core collaborators (admin API, UI
/// fan-out). Delivery is synchronous within the publishing task; subscribers
/// should not block.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic")]
pub enum GatewayEvent {
    #[serde(rename = "service:connected")]
    ServiceConnected {
        service_name: String,
        tools: Vec<String>,
        connection_time_ms: u64,
    },
    #[serde(rename = "service:disconnected")]
    ServiceDisconnected {
        service_name: String,
        reason: String,
        disconnection_time_ms: u64,
    },
    #[serde(rename = "service:connection:failed")]
    ServiceConnectionFailed {
        service_name: String,
        attempt: u32,
        error: String,
    },
    #[serde(rename = "endpoint:status:changed")]
    EndpointStatusChanged { connected: bool, url: String },
    #[serde(rename = "tool-registry:changed")]
    ToolRegistryChanged { tool_count: usize },
    #[serde(rename = "cache:stats")]
    CacheStats {
        entries: usize,
        pending: usize,
        evicted: usize,
    },
}

impl GatewayEvent {
    /// Stable topic string, matching the serialized tag.
    pub fn topic(&self) -> &'static str {
        match self {
            GatewayEvent::ServiceConnected { .. } => "service:connected",
            GatewayEvent::ServiceDisconnected { .. } => "service:disconnected",
            GatewayEvent::ServiceConnectionFailed { .. } => "service:connection:failed",
            GatewayEvent::EndpointStatusChanged { .. } => "endpoint:status:changed",
            GatewayEvent::ToolRegistryChanged { .. } => "tool-registry:changed",
            GatewayEvent::CacheStats { .. } => "cache:stats",
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

type Callback = Box<dyn Fn(&GatewayEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

/// Handle returned by [`EventBus::subscribe`]; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Process-local typed pub/sub.
///
/// A subscriber that panics is caught and logged; the remaining subscribers
/// still receive the event.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                id,
                callback: Box::new(callback),
            });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id != id.0);
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn publish(&self, event: GatewayEvent) {
        debug!(topic = event.topic(), "publishing event");
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(&event)));
            if let Err(panic) = result {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    topic = event.topic(),
                    subscriber = subscriber.id,
                    panic = %detail,
                    "event subscriber panicked"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Millisecond timestamp helper shared by event publishers.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
