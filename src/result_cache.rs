use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::events::{EventBus, GatewayEvent, epoch_millis};

/// Fixed eviction cadence.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(30);
/// Consumed entries older than this are removed.
const CONSUMED_MAX_AGE: Duration = Duration::from_secs(60);
/// Pending entries older than this are flagged as stalled.
const PENDING_STALL: Duration = Duration::from_secs(30);
/// Default TTL for entries whose caller did not pick one.
const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Bounded diagnostics ring buffer.
const MAX_TRANSITIONS: usize = 1000;

static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+_[0-9]+_[A-Za-z0-9]+$").expect("valid regex"));

/// Validate a task id against the canonical format.
pub fn is_valid_task_id(task_id: &str) -> bool {
    TASK_ID_RE.is_match(task_id)
}

/// `<toolName>_<epochMs>_<randomSuffix>`; tool names are sanitized so the
/// id always matches the canonical format.
pub fn generate_task_id(tool_name: &str) -> String {
    let sanitized: String = tool_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = if sanitized.is_empty() {
        "tool".to_string()
    } else {
        sanitized
    };
    let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("{sanitized}_{}_{suffix}", epoch_millis())
}

/// Canonical JSON rendering: object keys sorted recursively, so logically
/// equal argument objects map to one cache key.
pub fn canonicalize_args(args: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), canonical(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }
    canonical(args).to_string()
}

/// Cache key for a tool invocation.
pub fn cache_key(tool_name: &str, args: &Value) -> String {
    format!("{tool_name}::{}", canonicalize_args(args))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
    Consumed,
}

/// One status transition, kept for diagnostics. `to == None` means the
/// entry was deleted.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub task_id: String,
    pub from: Option<TaskStatus>,
    pub to: Option<TaskStatus>,
    pub at_ms: u64,
}

struct CacheEntry {
    tool_name: String,
    arguments: Value,
    task_id: String,
    status: TaskStatus,
    result: Option<Value>,
    error: Option<String>,
    created_at: Instant,
    started_at_ms: u64,
    finished_at: Option<Instant>,
    finished_at_ms: Option<u64>,
    consumed: bool,
    consumed_at: Option<Instant>,
    /// Status the entry held when it was consumed.
    consumed_from: Option<TaskStatus>,
    ttl: Duration,
    retry_count: u32,
}

/// Copied view handed to readers.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryView {
    pub tool_name: String,
    pub arguments: Value,
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub consumed: bool,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EvictionStats {
    pub expired: usize,
    pub consumed_removed: usize,
    pub stalled: usize,
}

/// Short-window result store with a per-task status lifecycle and one-shot
/// consumption. All state is in-memory; a single mutex guards mutation and
/// reads copy the entry out.
pub struct ResultCache {
    entries: StdMutex<HashMap<String, CacheEntry>>,
    /// task_id -> cache key, for task-oriented lookups.
    task_index: StdMutex<HashMap<String, String>>,
    transitions: StdMutex<VecDeque<TransitionRecord>>,
    default_ttl: Duration,
    bus: Option<Arc<EventBus>>,
}

impl ResultCache {
    pub fn new() -> Arc<Self> {
        Self::with_options(DEFAULT_TTL, None)
    }

    pub fn with_options(default_ttl: Duration, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new(Self {
            entries: StdMutex::new(HashMap::new()),
            task_index: StdMutex::new(HashMap::new()),
            transitions: StdMutex::new(VecDeque::with_capacity(64)),
            default_ttl,
            bus,
        })
    }

    /// Create a Pending entry for a starting tool call. Returns
    /// `(cache_key, task_id)`. A Failed predecessor under the same key
    /// bumps the retry counter.
    pub fn begin(&self, tool_name: &str, args: &Value) -> (String, String) {
        let key = cache_key(tool_name, args);
        let task_id = generate_task_id(tool_name);

        let mut entries = self.lock_entries();
        let retry_count = match entries.get(&key) {
            Some(prior) if prior.status == TaskStatus::Failed => prior.retry_count + 1,
            Some(prior) => prior.retry_count,
            None => 0,
        };

        if let Some(prior) = entries.remove(&key) {
            self.lock_index().remove(&prior.task_id);
            self.record_transition(&prior.task_id, Some(prior.status), None);
        }

        entries.insert(
            key.clone(),
            CacheEntry {
                tool_name: tool_name.to_string(),
                arguments: args.clone(),
                task_id: task_id.clone(),
                status: TaskStatus::Pending,
                result: None,
                error: None,
                created_at: Instant::now(),
                started_at_ms: epoch_millis(),
                finished_at: None,
                finished_at_ms: None,
                consumed: false,
                consumed_at: None,
                consumed_from: None,
                ttl: self.default_ttl,
                retry_count,
            },
        );
        self.lock_index().insert(task_id.clone(), key.clone());
        self.record_transition(&task_id, None, Some(TaskStatus::Pending));

        (key, task_id)
    }

    /// Low-level upsert for collaborators that manage their own task flow.
    ///
    /// `Pending` creates a fresh entry (the key is parsed back into a tool
    /// name best-effort); `Completed`/`Failed` finish the existing entry.
    pub fn put(&self, key: &str, status: TaskStatus, result: Option<Value>, error: Option<String>) {
        match status {
            TaskStatus::Pending => {
                let tool = key.split("::").next().unwrap_or("tool");
                let args = key
                    .split_once("::")
                    .and_then(|(_, raw)| serde_json::from_str(raw).ok())
                    .unwrap_or(Value::Null);
                self.begin(tool, &args);
            }
            TaskStatus::Completed => {
                self.complete(key, result.unwrap_or(Value::Null));
            }
            TaskStatus::Failed => {
                self.fail(key, error.unwrap_or_default());
            }
            TaskStatus::Consumed => {
                self.mark_consumed(key);
            }
        }
    }

    /// Pending -> Completed. Requires a result value.
    pub fn complete(&self, key: &str, result: Value) {
        self.finish(key, TaskStatus::Completed, Some(result), None);
    }

    /// Pending -> Failed. Requires a non-empty error.
    pub fn fail(&self, key: &str, error: String) {
        let error = if error.is_empty() {
            "unknown error".to_string()
        } else {
            error
        };
        self.finish(key, TaskStatus::Failed, None, Some(error));
    }

    fn finish(
        &self,
        key: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(key) else {
            warn!(key = %key, "finish on unknown cache entry");
            return;
        };
        if entry.status != TaskStatus::Pending {
            warn!(
                key = %key,
                status = ?entry.status,
                "finish on non-pending entry ignored"
            );
            return;
        }
        let from = entry.status;
        entry.status = status;
        entry.result = result;
        entry.error = error;
        entry.finished_at = Some(Instant::now());
        entry.finished_at_ms = Some(epoch_millis());
        let task_id = entry.task_id.clone();
        drop(entries);
        self.record_transition(&task_id, Some(from), Some(status));
    }

    pub fn get(&self, key: &str) -> Option<CacheEntryView> {
        self.lock_entries().get(key).map(view_of)
    }

    pub fn get_by_task_id(&self, task_id: &str) -> Option<CacheEntryView> {
        let key = self.lock_index().get(task_id).cloned()?;
        self.get(&key)
    }

    /// One-shot consumption: only a finished entry can be consumed, and a
    /// consumed entry is never available again.
    pub fn mark_consumed(&self, key: &str) -> bool {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if !matches!(entry.status, TaskStatus::Completed | TaskStatus::Failed) {
            return false;
        }
        let from = entry.status;
        entry.consumed_from = Some(from);
        entry.consumed = true;
        entry.consumed_at = Some(Instant::now());
        entry.status = TaskStatus::Consumed;
        let task_id = entry.task_id.clone();
        drop(entries);
        self.record_transition(&task_id, Some(from), Some(TaskStatus::Consumed));
        true
    }

    /// True iff the entry exists, has not expired, has not been consumed,
    /// and is Completed.
    pub fn is_available(&self, key: &str) -> bool {
        let entries = self.lock_entries();
        match entries.get(key) {
            Some(entry) => {
                entry.status == TaskStatus::Completed
                    && !entry.consumed
                    && entry.created_at.elapsed() <= entry.ttl
            }
            None => false,
        }
    }

    /// One eviction pass. Removes TTL-expired entries and stale Consumed
    /// entries; Pending entries past the stall threshold are failed (never
    /// silently removed) and become evictable on later passes.
    pub fn evict(&self) -> EvictionStats {
        let mut stats = EvictionStats::default();
        let mut removed: Vec<(String, TaskStatus)> = Vec::new();
        let mut stalled: Vec<String> = Vec::new();

        {
            let mut entries = self.lock_entries();
            entries.retain(|_key, entry| {
                if entry.status == TaskStatus::Pending {
                    if entry.created_at.elapsed() > PENDING_STALL {
                        stalled.push(entry.task_id.clone());
                        entry.status = TaskStatus::Failed;
                        entry.error = Some("execution timeout".to_string());
                        entry.finished_at = Some(Instant::now());
                        entry.finished_at_ms = Some(epoch_millis());
                        stats.stalled += 1;
                    }
                    return true;
                }

                if entry.status == TaskStatus::Consumed {
                    let age = entry
                        .consumed_at
                        .map(|t| t.elapsed())
                        .unwrap_or_else(|| entry.created_at.elapsed());
                    if age > CONSUMED_MAX_AGE {
                        removed.push((entry.task_id.clone(), entry.status));
                        stats.consumed_removed += 1;
                        return false;
                    }
                }

                if entry.created_at.elapsed() > entry.ttl {
                    removed.push((entry.task_id.clone(), entry.status));
                    stats.expired += 1;
                    return false;
                }

                true
            });
        }

        for task_id in stalled {
            self.record_transition(&task_id, Some(TaskStatus::Pending), Some(TaskStatus::Failed));
        }
        for (task_id, from) in removed {
            self.lock_index().remove(&task_id);
            self.record_transition(&task_id, Some(from), None);
        }

        if stats.expired + stats.consumed_removed + stats.stalled > 0 {
            debug!(
                expired = stats.expired,
                consumed = stats.consumed_removed,
                stalled = stats.stalled,
                "cache eviction pass"
            );
        }
        stats
    }

    /// Integrity check for diagnostics and tests: returns human-readable
    /// violations, empty when the cache is consistent.
    pub fn validate(&self) -> Vec<String> {
        let entries = self.lock_entries();
        let mut violations = Vec::new();
        for (key, entry) in entries.iter() {
            if !is_valid_task_id(&entry.task_id) {
                violations.push(format!("{key}: malformed task id '{}'", entry.task_id));
            }
            match entry.status {
                TaskStatus::Completed => {
                    if entry.finished_at.is_none() {
                        violations.push(format!("{key}: Completed without finishedAt"));
                    }
                    if entry.result.is_none() {
                        violations.push(format!("{key}: Completed without result"));
                    }
                }
                TaskStatus::Failed => {
                    if entry.error.as_deref().is_none_or(str::is_empty) {
                        violations.push(format!("{key}: Failed without error"));
                    }
                }
                TaskStatus::Consumed => {
                    if !matches!(
                        entry.consumed_from,
                        Some(TaskStatus::Completed) | Some(TaskStatus::Failed)
                    ) {
                        violations.push(format!("{key}: Consumed without prior completion"));
                    }
                }
                TaskStatus::Pending => {
                    if entry.result.is_some() || entry.finished_at.is_some() {
                        violations.push(format!("{key}: Pending with completion data"));
                    }
                }
            }
        }
        violations
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|e| e.status == TaskStatus::Pending)
            .count()
    }

    /// Recent transitions, oldest first.
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn record_transition(&self, task_id: &str, from: Option<TaskStatus>, to: Option<TaskStatus>) {
        let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        if transitions.len() >= MAX_TRANSITIONS {
            transitions.pop_front();
        }
        transitions.push_back(TransitionRecord {
            task_id: task_id.to_string(),
            from,
            to,
            at_ms: epoch_millis(),
        });
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.task_index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn view_of(entry: &CacheEntry) -> CacheEntryView {
    CacheEntryView {
        tool_name: entry.tool_name.clone(),
        arguments: entry.arguments.clone(),
        task_id: entry.task_id.clone(),
        status: entry.status,
        result: entry.result.clone(),
        error: entry.error.clone(),
        started_at_ms: entry.started_at_ms,
        finished_at_ms: entry.finished_at_ms,
        consumed: entry.consumed,
        retry_count: entry.retry_count,
    }
}

/// Periodic eviction driver. Runs until `shutdown` is notified, publishing
/// `cache:stats` after each pass.
pub async fn run_eviction_loop(cache: Arc<ResultCache>, shutdown: Arc<Notify>) {
    info!(
        interval_secs = EVICTION_INTERVAL.as_secs(),
        "cache eviction loop started"
    );
    loop {
        tokio::select! {
            _ = tokio::time::sleep(EVICTION_INTERVAL) => {}
            _ = shutdown.notified() => {
                info!("cache eviction loop shutting down");
                return;
            }
        }

        let stats = cache.evict();
        if let Some(bus) = &cache.bus {
            bus.publish(GatewayEvent::CacheStats {
                entries: cache.len(),
                pending: cache.pending_count(),
                evicted: stats.expired + stats.consumed_removed,
            });
        }
    }
}
