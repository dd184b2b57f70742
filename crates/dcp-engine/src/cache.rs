//! Bounded, process-wide JobSpec cache (§4.5), keyed by `(project,
//! configID)`. Readers hit under a read lock; a miss upgrades to the write
//! lock, fetches from the store, and inserts.
//!
//! Eviction is FIFO rather than true LRU: the read path only ever takes a
//! read lock, so there is nowhere to record recency on a hit without
//! contending with every other reader. A `VecDeque` insertion order,
//! trimmed under the same write lock used for inserts, gives a bounded
//! cache with O(1) eviction at the cost of not promoting re-read entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dcp_store::TaskStore;
use dcp_types::JsonMap;
use tokio::sync::RwLock;

use crate::error::EngineError;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    project: String,
    config_id: String,
}

struct Inner {
    entries: HashMap<CacheKey, JsonMap>,
    order: VecDeque<CacheKey>,
    capacity: usize,
}

/// Shared JobSpec cache handle; cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct JobSpecCache {
    inner: Arc<RwLock<Inner>>,
}

impl JobSpecCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    /// Resolve a job spec, hitting the cache under a read lock first and
    /// falling back to `store.get_job_spec` on miss.
    pub async fn get(
        &self,
        store: &dyn TaskStore,
        project: &str,
        config_id: &str,
    ) -> Result<JsonMap, EngineError> {
        let key = CacheKey {
            project: project.to_string(),
            config_id: config_id.to_string(),
        };

        if let Some(spec) = self.inner.read().await.entries.get(&key) {
            return Ok(spec.clone());
        }

        let job_config_id = format!("projects/{project}/jobConfigs/{config_id}");
        let spec = store.get_job_spec(&job_config_id).await?;

        let mut inner = self.inner.write().await;
        if !inner.entries.contains_key(&key) {
            if inner.entries.len() >= inner.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                }
            }
            inner.order.push_back(key.clone());
            inner.entries.insert(key, spec.clone());
        }
        Ok(spec)
    }
}
