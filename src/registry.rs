use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Owner name reported for custom-overlay tools.
pub const CUSTOM_SERVICE_NAME: &str = "customMCP";

/// Separator between service name and tool name on the wire.
pub const NAME_SEPARATOR: &str = "__";

/// A tool as published by one backend. Immutable once discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One entry in the aggregated catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedTool {
    /// Gateway-visible wire name (`service__tool`, or the declared name for
    /// custom tools).
    pub name: String,
    /// Owning service (`customMCP` for overlay entries).
    pub service_name: String,
    /// Name the owning backend knows the tool by.
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Normalise a service name for the wire: `-` becomes `_`.
pub fn normalize_service_name(service: &str) -> String {
    service.replace('-', "_")
}

/// Build the wire name for a backend tool.
pub fn wire_tool_name(service: &str, tool: &str) -> String {
    format!("{}{}{}", normalize_service_name(service), NAME_SEPARATOR, tool)
}

/// An immutable materialisation of the registry, published to readers.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    tools: Vec<AggregatedTool>,
    by_name: HashMap<String, usize>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&AggregatedTool> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    /// All entries, in registration order (overlay first, then backends in
    /// configuration order).
    pub fn list(&self) -> &[AggregatedTool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Reverse a wire name into `(service, original)` within this snapshot.
    pub fn resolve(&self, name: &str) -> Option<(&str, &str)> {
        self.get(name)
            .map(|t| (t.service_name.as_str(), t.original_name.as_str()))
    }
}

/// Tools from one connected service, as fed into a rebuild.
pub struct ServiceTools<'a> {
    pub service_name: &'a str,
    pub tools: &'a [ToolDescriptor],
    /// Per-tool enable switch from configuration; `true` when unset.
    pub enabled: &'a dyn Fn(&str) -> bool,
}

/// Aggregated tool registry.
///
/// Rebuilds are coarse: every connect/disconnect materialises a fresh
/// snapshot. Readers go through `ArcSwap` and never block writers.
pub struct ToolRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl ToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        })
    }

    /// Current snapshot. Lock-free; the returned Arc stays valid across
    /// subsequent rebuilds.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Rebuild the catalogue from the overlay plus every connected service,
    /// in configuration order.
    ///
    /// Collision rules: overlay names are reserved and always win; among
    /// backends the earliest registration wins and later collisions get a
    /// numeric suffix, logged as a warning.
    pub fn rebuild(&self, overlay: &[AggregatedTool], services: &[ServiceTools<'_>]) -> usize {
        let mut tools: Vec<AggregatedTool> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for entry in overlay {
            if by_name.contains_key(&entry.name) {
                warn!(tool = %entry.name, "duplicate custom tool name, keeping first");
                continue;
            }
            by_name.insert(entry.name.clone(), tools.len());
            tools.push(entry.clone());
        }

        for service in services {
            for tool in service.tools {
                if !(service.enabled)(&tool.name) {
                    debug!(
                        service = %service.service_name,
                        tool = %tool.name,
                        "tool disabled by config, skipping"
                    );
                    continue;
                }

                let wire_name = wire_tool_name(service.service_name, &tool.name);

                let final_name = if let Some(&idx) = by_name.get(&wire_name) {
                    if tools[idx].service_name == CUSTOM_SERVICE_NAME {
                        warn!(
                            service = %service.service_name,
                            tool = %wire_name,
                            "backend tool shadowed by custom tool, skipping"
                        );
                        continue;
                    }
                    // Name collision between backends (e.g. normalisation of
                    // 'a-b' and 'a_b'): earliest wins, later gets a suffix.
                    let mut n = 2;
                    let mut candidate = format!("{wire_name}_{n}");
                    while by_name.contains_key(&candidate) {
                        n += 1;
                        candidate = format!("{wire_name}_{n}");
                    }
                    warn!(
                        service = %service.service_name,
                        tool = %wire_name,
                        renamed = %candidate,
                        "wire name collision, disambiguating with suffix"
                    );
                    candidate
                } else {
                    wire_name
                };

                by_name.insert(final_name.clone(), tools.len());
                tools.push(AggregatedTool {
                    name: final_name,
                    service_name: service.service_name.to_string(),
                    original_name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                });
            }
        }

        let count = tools.len();
        self.snapshot
            .store(Arc::new(RegistrySnapshot { tools, by_name }));
        count
    }

    pub fn tool_count(&self) -> usize {
        self.snapshot.load().len()
    }
}
