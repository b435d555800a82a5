//! kube-policy - admission control for Kubernetes driven by Policy resources.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Starts the policy cache, event recorder, health server and webhook
//!   server on every replica
//! - Runs leader election; only the leader runs the policy controller

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kube_policy::client::KubeClusterStore;
use kube_policy::config::Config;
use kube_policy::controller::{context::Context, queue::WorkQueue, run_workers};
use kube_policy::events::{EventRecorder, KubeEventSink, RetryPolicy};
use kube_policy::health::{HealthState, run_health_server};
use kube_policy::violation::{KubeViolationStore, ViolationBuilder};
use kube_policy::webhooks::{FileKeyPair, WebhookState};
use kube_policy::{drive_policy_events, policy_cache, run_webhook_server, wait_for_shutdown};

/// Lease configuration
const LEASE_NAME: &str = "kube-policy-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kube_policy=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    let config = Config::parse();
    info!(webhook_port = config.webhook_port, workers = config.workers, "Starting kube-policy");

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    // Create Kubernetes client
    let client = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let options = KubeConfigOptions::default();
            Client::try_from(kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?)?
        }
        None => Client::try_default().await?,
    };
    info!("Connected to Kubernetes cluster");

    // Get pod identity for leader election and event reporting
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    let health_state = Arc::new(HealthState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start health server immediately (probes should work even as non-leader)
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Policy cache, fed by the watch stream on every replica
    let queue = WorkQueue::new(config.queue_config());
    let (cache, policy_events) = policy_cache(client.clone());
    let informer_handle = tokio::spawn(drive_policy_events(
        policy_events,
        queue.clone(),
        Some(health_state.clone()),
    ));

    // Event recorder with its single background worker
    let (recorder, event_worker) = EventRecorder::new(
        Arc::new(KubeEventSink::new(client.clone(), Some(pod_name.clone()))),
        RetryPolicy::default(),
        config.shutdown_grace,
        Some(health_state.clone()),
    );
    let event_handle = tokio::spawn(event_worker.run(shutdown_rx.clone()));

    // Webhook server on every replica
    let mut webhook_handle = {
        let state = Arc::new(
            WebhookState::new(cache.clone(), config.admission_timeout)
                .with_recorder(recorder.clone())
                .with_queue(queue.clone())
                .with_health(health_state.clone()),
        );
        let keys = FileKeyPair::new(config.cert.clone(), config.key.clone());
        let addr = config.webhook_addr();
        let shutdown = shutdown_rx.clone();
        let grace = config.shutdown_grace;
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(state, &keys, addr, shutdown, grace).await {
                error!("Webhook server error: {}", e);
            }
        })
    };

    // Leader election, then the controller
    let controller_handle = {
        let ctx = Arc::new(Context::new(
            cache,
            Arc::new(KubeClusterStore::new(client.clone())),
            ViolationBuilder::new(
                Arc::new(KubeViolationStore::new(client.clone())),
                Some(recorder.clone()),
            ),
            Some(recorder),
            Some(health_state.clone()),
        ));
        let settings = config.controller_settings();
        let shutdown = shutdown_rx.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lead(client, &namespace, &pod_name) => {
                    run_workers(queue, ctx, settings, shutdown).await;
                }
                _ = wait_for_shutdown(shutdown.clone()) => {}
            }
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    let mut webhook_stopped = false;
    tokio::select! {
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = informer_handle => {
            if let Err(e) = result {
                error!("Policy informer task panicked: {}", e);
            }
        }
        result = &mut webhook_handle => {
            webhook_stopped = true;
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    // Mark as not ready to stop receiving new work
    health_state.set_ready(false).await;
    let _ = shutdown_tx.send(true);

    let grace = config.shutdown_grace * 2;
    if !webhook_stopped && tokio::time::timeout(grace, webhook_handle).await.is_err() {
        warn!("Webhook server did not stop in time");
    }
    if tokio::time::timeout(grace, controller_handle).await.is_err() {
        warn!("Controller did not stop in time");
    }
    if let Ok(Ok(stats)) = tokio::time::timeout(grace, event_handle).await {
        info!(delivered = stats.delivered, dropped = stats.dropped, discarded = stats.discarded, "Event recorder stopped");
    }

    info!("kube-policy stopped");
    Ok(())
}

/// Block until this replica holds the lease, then keep renewing it in the
/// background. Losing the lease exits the process so Kubernetes restarts it
/// into a fresh election.
async fn lead(client: Client, namespace: &str, holder_id: &str) {
    let params = || LeaseLockParams {
        holder_id: holder_id.to_string(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
    };
    let lease_lock = LeaseLock::new(client.clone(), namespace, params());

    info!(holder_id = %holder_id, namespace = %namespace, lease_name = LEASE_NAME, "Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let renewal_lock = LeaseLock::new(client, namespace, params());
    #[allow(clippy::exit)]
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            match renewal_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal: the process cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
