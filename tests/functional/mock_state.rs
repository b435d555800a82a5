//! In-memory stand-ins for the cluster, used by the functional tests.
//!
//! The stores implement the same traits the controller and violation
//! builder use in production, so the real reconciliation and admission code
//! runs unchanged against them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{reflector, watcher};
use serde_json::Value;

use kube_policy::PolicyCache;
use kube_policy::client::{ClusterStore, Error, Result};
use kube_policy::controller::context::Context;
use kube_policy::crd::{Policy, PolicyViolation, ResourceRef};
use kube_policy::events::{EventRecorder, EventSink, EventWorker, PolicyEvent, RetryPolicy};
use kube_policy::violation::{ViolationBuilder, ViolationStore};

type ObjectKey = (String, Option<String>, String);

/// Cluster objects keyed by (kind, namespace, name).
#[derive(Default)]
pub struct MemoryClusterStore {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    creates: AtomicUsize,
    fail_lists: AtomicBool,
}

impl MemoryClusterStore {
    pub fn insert(&self, object: Value) {
        let id = ResourceRef::from_object(&object);
        self.objects
            .lock()
            .unwrap()
            .insert((id.kind, id.namespace, id.name), object);
    }

    pub fn remove(&self, kind: &str, namespace: Option<&str>, name: &str) {
        self.objects.lock().unwrap().remove(&(
            kind.to_string(),
            namespace.map(str::to_string),
            name.to_string(),
        ));
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&(
                kind.to_string(),
                namespace.map(str::to_string),
                name.to_string(),
            ))
            .cloned()
    }

    /// Number of successful `create` calls.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Make every `list` fail with a retryable error.
    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn list(&self, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(Error::UnknownKind(kind.to_string()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), _)| k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<Value>> {
        Ok(self.object(kind, namespace, name))
    }

    async fn create(&self, kind: &str, namespace: Option<&str>, mut object: Value) -> Result<Value> {
        if object.get("kind").is_none() {
            object["kind"] = Value::String(kind.to_string());
        }
        if let Some(ns) = namespace {
            object["metadata"]["namespace"] = Value::String(ns.to_string());
        }
        self.insert(object.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }
}

/// PolicyViolation records keyed by object name.
#[derive(Default)]
pub struct MemoryViolationStore {
    records: Mutex<BTreeMap<String, PolicyViolation>>,
}

impl MemoryViolationStore {
    pub fn all(&self) -> Vec<PolicyViolation> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn for_policy(&self, policy: &str) -> Vec<PolicyViolation> {
        self.all()
            .into_iter()
            .filter(|v| v.spec.policy == policy)
            .collect()
    }

    /// Seed a record directly, bypassing the builder.
    pub fn seed(&self, violation: PolicyViolation) {
        self.records
            .lock()
            .unwrap()
            .insert(violation.name_any(), violation);
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn get(&self, name: &str) -> Result<Option<PolicyViolation>> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    async fn create(&self, violation: &PolicyViolation) -> Result<()> {
        self.seed(violation.clone());
        Ok(())
    }

    async fn replace(&self, violation: &PolicyViolation) -> Result<()> {
        let name = violation.name_any();
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(&name) {
            return Err(Error::InvalidObject(format!("{} does not exist", name)));
        }
        records.insert(name, violation.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_for_policy(&self, policy: &str) -> Result<Vec<PolicyViolation>> {
        Ok(self.for_policy(policy))
    }

    async fn list_all(&self) -> Result<Vec<PolicyViolation>> {
        Ok(self.all())
    }
}

/// Event sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PolicyEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn write(&self, event: &PolicyEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A controller context wired to in-memory stores.
pub struct Harness {
    writer: Writer<Policy>,
    pub cache: PolicyCache,
    pub cluster: Arc<MemoryClusterStore>,
    pub violations: Arc<MemoryViolationStore>,
    pub sink: Arc<RecordingSink>,
    pub recorder: EventRecorder,
    pub ctx: Context,
    worker: Option<EventWorker>,
}

impl Harness {
    /// A harness whose Policy cache has synced an empty initial listing.
    pub fn new() -> Self {
        let mut harness = Self::unsynced();
        harness.writer.apply_watcher_event(&watcher::Event::Init);
        harness.finish_sync();
        harness
    }

    /// A harness whose Policy cache has not received its initial listing.
    pub fn unsynced() -> Self {
        let (store, writer) = reflector::store::<Policy>();
        let cache = PolicyCache::new(store);
        let cluster = Arc::new(MemoryClusterStore::default());
        let violations = Arc::new(MemoryViolationStore::default());
        let sink = Arc::new(RecordingSink::default());
        let (recorder, worker) = EventRecorder::new(
            sink.clone(),
            RetryPolicy::default(),
            Duration::from_secs(1),
            None,
        );
        let ctx = Context::new(
            cache.clone(),
            cluster.clone(),
            ViolationBuilder::new(violations.clone(), Some(recorder.clone())),
            Some(recorder.clone()),
            None,
        );
        Self {
            writer,
            cache,
            cluster,
            violations,
            sink,
            recorder,
            ctx,
            worker: Some(worker),
        }
    }

    pub fn apply_policy(&mut self, policy: Policy) {
        self.writer
            .apply_watcher_event(&watcher::Event::Apply(policy));
    }

    pub fn delete_policy(&mut self, policy: Policy) {
        self.writer
            .apply_watcher_event(&watcher::Event::Delete(policy));
    }

    /// Deliver policies as part of the initial listing, without completing it.
    pub fn list_policies(&mut self, policies: Vec<Policy>) {
        self.writer.apply_watcher_event(&watcher::Event::Init);
        for policy in policies {
            self.writer
                .apply_watcher_event(&watcher::Event::InitApply(policy));
        }
    }

    /// Complete the initial listing.
    pub fn finish_sync(&mut self) {
        self.writer.apply_watcher_event(&watcher::Event::InitDone);
    }

    /// Stop the event worker, which drains the queue, and return what the
    /// sink received. Events emitted afterwards are not delivered.
    pub async fn flush_events(&mut self) -> Vec<PolicyEvent> {
        if let Some(worker) = self.worker.take() {
            let (_tx, rx) = tokio::sync::watch::channel(true);
            let stats = worker.run(rx).await;
            assert_eq!(stats.dropped, 0);
        }
        self.sink.events()
    }
}
