use crate::error::SwitchboardResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Numeric metric samples kept per metric.
pub const METRIC_HISTORY_LEN: usize = 100;

const WATCH_CAPACITY: usize = 32;

/// A change to one key of the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeUpdate {
    pub key: String,
    /// New value, or `None` when the key was deleted.
    pub value: Option<Value>,
    pub at: DateTime<Utc>,
}

/// Shared blackboard that agents and the orchestrator read and write.
///
/// Single-key operations only; nothing is transactional across keys.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn get(&self, key: &str) -> SwitchboardResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> SwitchboardResult<()>;

    /// Removes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> SwitchboardResult<bool>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> SwitchboardResult<Vec<String>>;

    /// Live updates for `key`, starting from the next change.
    async fn subscribe(&self, key: &str) -> SwitchboardResult<broadcast::Receiver<KnowledgeUpdate>>;

    /// Stores `metrics.<category>.<name>` and appends numeric values to its history.
    ///
    /// The default implementation is a read-modify-write over `get`/`set`;
    /// stores that can do better should override it.
    async fn update_metric(&self, category: &str, name: &str, value: Value) -> SwitchboardResult<()> {
        let key = metric_key(category, name);
        if value.is_number() {
            let hkey = history_key(category, name);
            let history = self.get(&hkey).await?;
            self.set(&hkey, push_history(history, &value)).await?;
        }
        self.set(&key, value).await
    }

    async fn get_metric(&self, category: &str, name: &str) -> SwitchboardResult<Option<Value>> {
        self.get(&metric_key(category, name)).await
    }

    /// Adds `delta` to an integer metric (missing counts as zero) and returns the new value.
    async fn increment_metric(&self, category: &str, name: &str, delta: i64) -> SwitchboardResult<i64> {
        let current = self
            .get_metric(category, name)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let next = current + delta;
        self.update_metric(category, name, Value::from(next)).await?;
        Ok(next)
    }
}

/// Key under which a metric's current value lives.
pub fn metric_key(category: &str, name: &str) -> String {
    format!("metrics.{category}.{name}")
}

/// Key under which a metric's sample history lives.
pub fn history_key(category: &str, name: &str) -> String {
    format!("history.{category}.{name}")
}

fn push_history(history: Option<Value>, value: &Value) -> Value {
    let mut samples = match history {
        Some(Value::Array(samples)) => samples,
        _ => Vec::new(),
    };
    samples.push(serde_json::json!({ "at": Utc::now(), "value": value }));
    if samples.len() > METRIC_HISTORY_LEN {
        let excess = samples.len() - METRIC_HISTORY_LEN;
        samples.drain(..excess);
    }
    Value::Array(samples)
}

/// Process-local knowledge base.
pub struct InMemoryKnowledgeBase {
    data: RwLock<HashMap<String, Value>>,
    watchers: RwLock<HashMap<String, broadcast::Sender<KnowledgeUpdate>>>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
        }
    }

    async fn notify(&self, key: &str, value: Option<Value>) {
        let watchers = self.watchers.read().await;
        if let Some(tx) = watchers.get(key) {
            // No receivers is fine.
            let _ = tx.send(KnowledgeUpdate {
                key: key.to_string(),
                value,
                at: Utc::now(),
            });
        }
    }
}

impl Default for InMemoryKnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn get(&self, key: &str) -> SwitchboardResult<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> SwitchboardResult<()> {
        self.data.write().await.insert(key.to_string(), value.clone());
        tracing::debug!(key, "Knowledge base set");
        self.notify(key, Some(value)).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SwitchboardResult<bool> {
        let existed = self.data.write().await.remove(key).is_some();
        if existed {
            self.notify(key, None).await;
        }
        Ok(existed)
    }

    async fn list_keys(&self, prefix: &str) -> SwitchboardResult<Vec<String>> {
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn subscribe(&self, key: &str) -> SwitchboardResult<broadcast::Receiver<KnowledgeUpdate>> {
        let mut watchers = self.watchers.write().await;
        let tx = watchers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0);
        Ok(tx.subscribe())
    }

    async fn update_metric(&self, category: &str, name: &str, value: Value) -> SwitchboardResult<()> {
        let key = metric_key(category, name);
        let hkey = history_key(category, name);
        let history = {
            let mut data = self.data.write().await;
            data.insert(key.clone(), value.clone());
            if value.is_number() {
                let history = push_history(data.remove(&hkey), &value);
                data.insert(hkey.clone(), history.clone());
                Some(history)
            } else {
                None
            }
        };
        self.notify(&key, Some(value)).await;
        if let Some(history) = history {
            self.notify(&hkey, Some(history)).await;
        }
        Ok(())
    }

    async fn increment_metric(&self, category: &str, name: &str, delta: i64) -> SwitchboardResult<i64> {
        let key = metric_key(category, name);
        let hkey = history_key(category, name);
        let (next, history) = {
            let mut data = self.data.write().await;
            let next = data.get(&key).and_then(Value::as_i64).unwrap_or(0) + delta;
            data.insert(key.clone(), Value::from(next));
            let history = push_history(data.remove(&hkey), &Value::from(next));
            data.insert(hkey.clone(), history.clone());
            (next, history)
        };
        self.notify(&key, Some(Value::from(next))).await;
        self.notify(&hkey, Some(history)).await;
        Ok(next)
    }
}
