//! Policy Controller.
//!
//! Policy names flow into a deduplicating `WorkQueue` from watch events,
//! periodic resync and admission nudges. A fixed pool of workers takes keys
//! from the queue, so each policy has at most one pass in flight while
//! different policies reconcile in parallel.

pub mod context;
pub mod error;
pub mod queue;
pub mod reconciler;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use context::Context;
use queue::WorkQueue;

/// Worker pool and resync settings.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_period: Duration,
    pub pass_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_period: Duration::from_secs(300),
            pass_timeout: Duration::from_secs(60),
        }
    }
}

/// Queue every cached policy plus every policy still referenced by a
/// violation record, so records of policies deleted while no controller was
/// running are cleaned up too.
pub async fn enqueue_all(queue: &WorkQueue, ctx: &Context) {
    let mut names: BTreeSet<String> = ctx.cache.names().into_iter().collect();
    match ctx.violations.referenced_policies().await {
        Ok(referenced) => names.extend(referenced),
        Err(e) => warn!(error = %e, "Failed to list violations for resync"),
    }
    if let Some(health) = &ctx.health_state {
        health.metrics.set_policies_cached(ctx.cache.snapshot().len());
    }
    debug!(count = names.len(), "Resync");
    for name in &names {
        queue.add(name);
    }
}

/// Run the worker pool and resync ticker until `shutdown` turns true.
///
/// Nothing is reconciled before the Policy cache holds its initial listing,
/// since an unsynced cache cannot tell a deleted policy from one not yet
/// seen. On shutdown the queue stops handing out keys and in-flight passes
/// are allowed to finish.
pub async fn run_workers(
    queue: WorkQueue,
    ctx: Arc<Context>,
    settings: ControllerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        ready = ctx.cache.wait_until_ready() => {
            if !ready {
                warn!("Policy watch ended before the cache synced");
            }
        }
        _ = crate::wait_for_shutdown(shutdown.clone()) => {
            queue.shutdown();
            info!("Policy controller stopped before the cache synced");
            return;
        }
    }

    info!(workers = settings.workers, resync_secs = settings.resync_period.as_secs(), "Starting policy controller");
    let mut workers = JoinSet::new();
    for id in 0..settings.workers.max(1) {
        let queue = queue.clone();
        let ctx = ctx.clone();
        workers.spawn(async move {
            while let Some(key) = queue.next().await {
                reconciler::process(&queue, &ctx, &key, settings.pass_timeout).await;
            }
            debug!(worker = id, "Worker stopped");
        });
    }

    let mut resync = tokio::time::interval(settings.resync_period);
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = resync.tick() => enqueue_all(&queue, &ctx).await,
        }
    }

    queue.shutdown();
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Controller worker panicked");
        }
    }
    info!("Policy controller stopped");
}
