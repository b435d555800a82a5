//! kube-policy library crate
//!
//! Admission control for Kubernetes driven by declarative Policy resources:
//! the policy engine, the webhook server, the policy controller, the
//! violation builder and the event recorder.

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod events;
pub mod health;
pub mod violation;
pub mod webhooks;

pub use cache::{PolicyCache, PolicySnapshot};
pub use engine::PolicyEngine;
pub use health::HealthState;
pub use webhooks::{WEBHOOK_PORT, WebhookError, run_webhook_server};

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use controller::queue::WorkQueue;
use crd::Policy;

/// Create the default watcher configuration.
///
/// `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create the reflector-backed Policy cache.
///
/// Returns the cache and the watch stream that keeps it current. The stream
/// must be polled (see `drive_policy_events`) for the cache to fill.
pub fn policy_cache(
    client: Client,
) -> (
    PolicyCache,
    impl Stream<Item = Result<watcher::Event<Policy>, watcher::Error>>,
) {
    let api: Api<Policy> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, default_watcher_config())).default_backoff();
    (PolicyCache::new(reader), stream)
}

/// Poll the Policy watch stream, queueing every added, changed or deleted
/// policy. Readiness is signalled once the initial listing is in the cache.
pub async fn drive_policy_events<S>(stream: S, queue: WorkQueue, health_state: Option<Arc<HealthState>>)
where
    S: Stream<Item = Result<watcher::Event<Policy>, watcher::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(policy)) | Ok(watcher::Event::Delete(policy)) => {
                debug!(policy = %policy.name_any(), "Policy changed");
                queue.add(&policy.name_any());
            }
            Ok(watcher::Event::InitApply(policy)) => queue.add(&policy.name_any()),
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitDone) => {
                info!("Policy cache synced");
                if let Some(state) = &health_state {
                    state.set_ready(true).await;
                }
            }
            Err(e) => warn!(error = %e, "Policy watch error"),
        }
    }
    warn!("Policy watch stream ended");
}

/// Resolve once `shutdown` turns true or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
