//! Startup configuration from flags and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use jiff::SignedDuration;

use crate::controller::ControllerSettings;
use crate::controller::queue::QueueConfig;

/// Kubernetes admission controller driven by declarative policies.
#[derive(Parser, Debug, Clone)]
#[command(name = "kube-policy", version, about)]
pub struct Config {
    /// Path to a kubeconfig file; in-cluster credentials are used when unset.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// TLS certificate (PEM) served by the webhook.
    #[arg(long, env = "WEBHOOK_CERT_PATH", default_value = "/etc/webhook/certs/tls.crt")]
    pub cert: PathBuf,

    /// TLS private key (PEM) served by the webhook.
    #[arg(long, env = "WEBHOOK_KEY_PATH", default_value = "/etc/webhook/certs/tls.key")]
    pub key: PathBuf,

    #[arg(long, env = "WEBHOOK_PORT", default_value_t = crate::webhooks::WEBHOOK_PORT)]
    pub webhook_port: u16,

    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Concurrent policy reconciliations.
    #[arg(long, env = "CONTROLLER_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Interval between full resyncs.
    #[arg(long, env = "RESYNC_PERIOD", default_value = "5m", value_parser = parse_positive_duration)]
    pub resync_period: Duration,

    /// Deadline for one reconciliation pass.
    #[arg(long, env = "RECONCILE_TIMEOUT", default_value = "60s", value_parser = parse_positive_duration)]
    pub reconcile_timeout: Duration,

    /// Failed passes before a policy is given up until the next event.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Evaluation budget per admission request.
    #[arg(long, env = "ADMISSION_TIMEOUT", default_value = "8s", value_parser = parse_positive_duration)]
    pub admission_timeout: Duration,

    /// Time allowed for in-flight work on shutdown.
    #[arg(long, env = "SHUTDOWN_GRACE_PERIOD", default_value = "5s", value_parser = parse_duration)]
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.webhook_port))
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers,
            resync_period: self.resync_period,
            pass_timeout: self.reconcile_timeout,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.max_retries,
            ..Default::default()
        }
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h30m`, an ISO 8601 duration such as
/// `PT5M`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let signed: SignedDuration = input
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", input, e))?;
    Duration::try_from(signed).map_err(|e| format!("invalid duration '{}': {}", input, e))
}

/// Like `parse_duration`, but zero is rejected. Used for intervals and
/// deadlines, which must be able to elapse.
pub fn parse_positive_duration(input: &str) -> Result<Duration, String> {
    let duration = parse_duration(input)?;
    if duration.is_zero() {
        return Err(format!("duration '{}' must be greater than zero", input.trim()));
    }
    Ok(duration)
}
