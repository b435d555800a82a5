//! Violation Builder.
//!
//! Records validation failures as PolicyViolation objects, deduplicated by
//! identity key (policy, resource, rule). The object name is derived from the
//! key, so recording is a get followed by either an update or a create.
//! Calls for different keys may run concurrently; calls for the same key are
//! serialized by the controller, which handles one policy per worker.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::client::Result;
use crate::crd::{POLICY_LABEL, PolicyViolation, ViolationKey, policy_label_value};
use crate::events::{EventRecorder, PolicyEvent};

/// Persistence for PolicyViolation records.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<PolicyViolation>>;
    async fn create(&self, violation: &PolicyViolation) -> Result<()>;
    /// Replace an existing record (`metadata.resourceVersion` must be set).
    async fn replace(&self, violation: &PolicyViolation) -> Result<()>;
    /// Delete a record; a missing record is not an error.
    async fn delete(&self, name: &str) -> Result<()>;
    /// Records whose `spec.policy` equals `policy`.
    async fn list_for_policy(&self, policy: &str) -> Result<Vec<PolicyViolation>>;
    /// All records.
    async fn list_all(&self) -> Result<Vec<PolicyViolation>>;
}

/// `ViolationStore` backed by the PolicyViolation custom resource.
pub struct KubeViolationStore {
    api: Api<PolicyViolation>,
}

impl KubeViolationStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ViolationStore for KubeViolationStore {
    async fn get(&self, name: &str) -> Result<Option<PolicyViolation>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, violation: &PolicyViolation) -> Result<()> {
        self.api.create(&PostParams::default(), violation).await?;
        Ok(())
    }

    async fn replace(&self, violation: &PolicyViolation) -> Result<()> {
        let name = violation.name_any();
        self.api
            .replace(&name, &PostParams::default(), violation)
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_for_policy(&self, policy: &str) -> Result<Vec<PolicyViolation>> {
        let selector = format!("{}={}", POLICY_LABEL, policy_label_value(policy));
        let list = self.api.list(&ListParams::default().labels(&selector)).await?;
        // the label may be truncated, so confirm on spec.policy
        Ok(list
            .items
            .into_iter()
            .filter(|v| v.spec.policy == policy)
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<PolicyViolation>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }
}

/// What `record` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
}

/// Creates, updates and clears PolicyViolation records.
#[derive(Clone)]
pub struct ViolationBuilder {
    store: Arc<dyn ViolationStore>,
    recorder: Option<EventRecorder>,
}

impl ViolationBuilder {
    pub fn new(store: Arc<dyn ViolationStore>, recorder: Option<EventRecorder>) -> Self {
        Self { store, recorder }
    }

    /// Record a failure for `key`, updating the existing record if present.
    pub async fn record(&self, key: &ViolationKey, message: &str) -> Result<RecordOutcome> {
        let now = jiff::Timestamp::now().to_string();
        let name = key.object_name();
        match self.store.get(&name).await? {
            Some(mut existing) => {
                existing.spec.message = message.to_string();
                existing.spec.last_seen = now;
                self.store.replace(&existing).await?;
                debug!(violation = %name, key = %key, "Updated policy violation");
                Ok(RecordOutcome::Updated)
            }
            None => {
                let violation = PolicyViolation::for_key(key, message, &now);
                match self.store.create(&violation).await {
                    Ok(()) => {}
                    // lost a create race; the next pass updates it
                    Err(e) if e.is_conflict() => return Ok(RecordOutcome::Updated),
                    Err(e) => return Err(e),
                }
                info!(violation = %name, key = %key, "Created policy violation");
                if let Some(recorder) = &self.recorder {
                    recorder.emit(PolicyEvent::violation_recorded(key, message));
                }
                Ok(RecordOutcome::Created)
            }
        }
    }

    /// Remove the record for `key`, if any.
    pub async fn clear(&self, key: &ViolationKey) -> Result<()> {
        let name = key.object_name();
        self.store.delete(&name).await?;
        debug!(violation = %name, key = %key, "Cleared policy violation");
        Ok(())
    }

    /// Remove every record of `policy`. Returns how many were removed.
    pub async fn clear_policy(&self, policy: &str) -> Result<usize> {
        let existing = self.store.list_for_policy(policy).await?;
        let count = existing.len();
        for violation in existing {
            self.store.delete(&violation.name_any()).await?;
        }
        if count > 0 {
            info!(policy = %policy, count, "Removed violations of deleted policy");
        }
        Ok(count)
    }

    /// Keys currently recorded for `policy`.
    pub async fn keys_for_policy(&self, policy: &str) -> Result<BTreeSet<ViolationKey>> {
        Ok(self
            .store
            .list_for_policy(policy)
            .await?
            .iter()
            .map(PolicyViolation::key)
            .collect())
    }

    /// Policy names referenced by any record.
    pub async fn referenced_policies(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|v| v.spec.policy)
            .collect())
    }
}

impl std::fmt::Debug for ViolationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationBuilder").finish_non_exhaustive()
    }
}
