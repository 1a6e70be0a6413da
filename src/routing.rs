//! Routing and model policy tables.
//!
//! Both tables are immutable once built. The reloader replaces them
//! wholesale inside a new `ConfigSnapshot`; nothing mutates a published
//! table in place.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::validate_model_name;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 4;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(2);

/// Source identity of a frame: (group, subgroup, id).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub source_group: String,
    pub source_subgroup: String,
    pub source_id: String,
}

impl RoutingKey {
    pub fn new(
        source_group: impl Into<String>,
        source_subgroup: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            source_group: source_group.into(),
            source_subgroup: source_subgroup.into(),
            source_id: source_id.into(),
        }
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source_group, self.source_subgroup, self.source_id
        )
    }
}

type RouteDocument = HashMap<String, HashMap<String, HashMap<String, String>>>;

/// Exact-match mapping from source identity to model name.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    routes: RouteDocument,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a routing document: `{ group: { subgroup: { source_id: model } } }`.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let routes: RouteDocument =
            serde_json::from_slice(raw).map_err(|e| anyhow!("invalid routing document: {}", e))?;
        for (group, subgroups) in &routes {
            for (subgroup, sources) in subgroups {
                for (source, model) in sources {
                    validate_model_name(model).map_err(|e| {
                        anyhow!("route {}/{}/{}: {}", group, subgroup, source, e)
                    })?;
                }
            }
        }
        Ok(Self { routes })
    }

    /// Builder used when assembling a table in code.
    pub fn with_route(mut self, key: &RoutingKey, model: impl Into<String>) -> Self {
        self.routes
            .entry(key.source_group.clone())
            .or_default()
            .entry(key.source_subgroup.clone())
            .or_default()
            .insert(key.source_id.clone(), model.into());
        self
    }

    /// Returns the model for `key`, or `None` when the source is unrouted.
    pub fn resolve(&self, key: &RoutingKey) -> Option<&str> {
        self.routes
            .get(&key.source_group)?
            .get(&key.source_subgroup)?
            .get(&key.source_id)
            .map(String::as_str)
    }

    /// Number of routed sources.
    pub fn len(&self) -> usize {
        self.routes
            .values()
            .flat_map(|subgroups| subgroups.values())
            .map(|sources| sources.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Size and age limits for one model's batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelPolicy {
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl Default for ModelPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl ModelPolicy {
    pub fn new(max_batch_size: usize, max_wait: Duration) -> Result<Self> {
        if max_batch_size == 0 {
            return Err(anyhow!("batch_size must be at least 1"));
        }
        Ok(Self {
            max_batch_size,
            max_wait,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct PolicyEntryFile {
    batch_size: Option<u64>,
    max_wait_time: Option<f64>,
}

/// Per-model policies. Models without an entry get the defaults.
#[derive(Clone, Debug, Default)]
pub struct PolicyTable {
    policies: HashMap<String, ModelPolicy>,
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a policy document: `{ model: { "batch_size": n, "max_wait_time": secs } }`.
    ///
    /// Missing fields fall back to the defaults. An out-of-range value
    /// rejects the whole document.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let doc: HashMap<String, PolicyEntryFile> =
            serde_json::from_slice(raw).map_err(|e| anyhow!("invalid policy document: {}", e))?;
        let mut policies = HashMap::with_capacity(doc.len());
        for (model, entry) in doc {
            let max_batch_size = match entry.batch_size {
                Some(size) => usize::try_from(size)
                    .map_err(|_| anyhow!("model {}: batch_size out of range", model))?,
                None => DEFAULT_MAX_BATCH_SIZE,
            };
            let max_wait = match entry.max_wait_time {
                Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
                    anyhow!(
                        "model {}: max_wait_time must be a non-negative number of seconds, got {}",
                        model,
                        secs
                    )
                })?,
                None => DEFAULT_MAX_WAIT,
            };
            let policy = ModelPolicy::new(max_batch_size, max_wait)
                .map_err(|e| anyhow!("model {}: {}", model, e))?;
            policies.insert(model, policy);
        }
        Ok(Self { policies })
    }

    pub fn with_policy(mut self, model: impl Into<String>, policy: ModelPolicy) -> Self {
        self.policies.insert(model.into(), policy);
        self
    }

    /// Policy for `model`, falling back to the defaults.
    pub fn policy_for(&self, model: &str) -> ModelPolicy {
        self.policies.get(model).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Opaque change marker for a configuration document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentVersion(u128);

impl DocumentVersion {
    pub fn new(marker: u128) -> Self {
        Self(marker)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let nanos = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self(nanos)
    }

    /// Folds a document length into the marker so a same-tick rewrite still registers.
    pub(crate) fn with_length(self, len: u64) -> Self {
        Self(self.0.wrapping_mul(1_000_003) ^ u128::from(len))
    }
}

/// Routing and policy tables published together.
#[derive(Clone, Debug, Default)]
pub struct ConfigSnapshot {
    pub routing: Arc<RoutingTable>,
    pub policies: Arc<PolicyTable>,
    pub routing_version: Option<DocumentVersion>,
    pub policy_version: Option<DocumentVersion>,
    /// Incremented by one for every published snapshot.
    pub generation: u64,
}

impl ConfigSnapshot {
    pub fn new(routing: RoutingTable, policies: PolicyTable) -> Self {
        Self {
            routing: Arc::new(routing),
            policies: Arc::new(policies),
            ..Self::default()
        }
    }

    pub fn resolve(&self, key: &RoutingKey) -> Option<&str> {
        self.routing.resolve(key)
    }

    pub fn policy_for(&self, model: &str) -> ModelPolicy {
        self.policies.policy_for(model)
    }
}
