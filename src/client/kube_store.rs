//! `ClusterStore` backed by the Kubernetes API.
//!
//! Kinds are resolved through API discovery. The kind table is refreshed
//! lazily when an unknown kind is requested, at most once per refresh
//! interval, so newly installed CRDs become usable without a restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::core::TypeMeta;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ClusterStore, Error, Result};

/// Minimum time between discovery runs triggered by unknown kinds.
const DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct KindTable {
    kinds: HashMap<String, (ApiResource, ApiCapabilities)>,
    refreshed_at: Option<Instant>,
}

/// Cluster store talking to the API server.
pub struct KubeClusterStore {
    client: Client,
    table: RwLock<KindTable>,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            table: RwLock::new(KindTable {
                kinds: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    async fn resolve(&self, kind: &str) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(found) = self.table.read().await.kinds.get(kind) {
            return Ok(found.clone());
        }

        let mut table = self.table.write().await;
        let stale = table
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= DISCOVERY_REFRESH_INTERVAL);
        if stale {
            let discovery = Discovery::new(self.client.clone())
                .run()
                .await
                .map_err(Error::Kube)?;
            table.kinds.clear();
            for group in discovery.groups() {
                for (resource, caps) in group.recommended_resources() {
                    // first group wins for kinds served by several groups
                    table
                        .kinds
                        .entry(resource.kind.clone())
                        .or_insert((resource, caps));
                }
            }
            table.refreshed_at = Some(Instant::now());
            info!(kinds = table.kinds.len(), "Refreshed API discovery");
        }
        table
            .kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    fn api(
        &self,
        resource: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (&caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, resource)
            }
            _ => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>> {
        let (resource, caps) = self.resolve(kind).await?;
        let list = self
            .api(&resource, &caps, namespace)
            .list(&ListParams::default())
            .await?;
        debug!(kind = %kind, count = list.items.len(), "Listed resources");
        list.items
            .into_iter()
            .map(|mut obj| {
                // list items come without type information
                obj.types = Some(TypeMeta {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                });
                serde_json::to_value(obj).map_err(Error::from)
            })
            .collect()
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<Value>> {
        let (resource, caps) = self.resolve(kind).await?;
        let found = self.api(&resource, &caps, namespace).get_opt(name).await?;
        found
            .map(|mut obj| {
                obj.types.get_or_insert_with(|| TypeMeta {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                });
                serde_json::to_value(obj).map_err(Error::from)
            })
            .transpose()
    }

    async fn create(&self, kind: &str, namespace: Option<&str>, object: Value) -> Result<Value> {
        let (resource, caps) = self.resolve(kind).await?;
        let mut obj: DynamicObject = serde_json::from_value(object)?;
        if obj.metadata.name.is_none() {
            return Err(Error::InvalidObject(format!("{} without metadata.name", kind)));
        }
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        let created = self
            .api(&resource, &caps, namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(serde_json::to_value(created)?)
    }
}
