//! Read-only Policy cache.
//!
//! A kube reflector keeps the store current from watch events. Consumers
//! never mutate it; they take a `PolicySnapshot`, an immutable, name-ordered
//! view that is passed explicitly into every engine call.
//!
//! Until the reflector has delivered its initial listing the store is empty,
//! so "not cached" only means "deleted" once the cache is ready.

use std::sync::Arc;

use futures::FutureExt;
use kube::ResourceExt;
use kube::runtime::reflector::{ObjectRef, Store};

use crate::crd::Policy;

/// Shared handle to the reflector-backed Policy store.
#[derive(Clone)]
pub struct PolicyCache {
    store: Store<Policy>,
}

impl PolicyCache {
    pub fn new(store: Store<Policy>) -> Self {
        Self { store }
    }

    /// Current policies, never blocking on the network.
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot::from_arcs(self.store.state())
    }

    /// Look up a single policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.store.get(&ObjectRef::new(name))
    }

    /// Names of all cached policies.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    /// Whether the initial listing has reached the store.
    pub fn is_ready(&self) -> bool {
        matches!(self.store.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    /// Wait for the initial listing. Returns `false` if the watch ended
    /// before it completed.
    pub async fn wait_until_ready(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }
}

/// Immutable set of policies, ordered by name.
#[derive(Clone, Debug, Default)]
pub struct PolicySnapshot {
    policies: Vec<Arc<Policy>>,
}

impl PolicySnapshot {
    pub fn from_arcs(mut policies: Vec<Arc<Policy>>) -> Self {
        policies.sort_by_key(|p| p.name_any());
        Self { policies }
    }

    pub fn from_policies(policies: Vec<Policy>) -> Self {
        Self::from_arcs(policies.into_iter().map(Arc::new).collect())
    }

    /// Snapshot holding one policy (used by reconciliation).
    pub fn single(policy: Arc<Policy>) -> Self {
        Self {
            policies: vec![policy],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name_any()).collect()
    }

    /// Whether any policy blocks on failure.
    pub fn any_enforcing(&self) -> bool {
        self.policies.iter().any(|p| p.is_enforcing())
    }
}
