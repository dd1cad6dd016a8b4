//! ndb-operator - A Kubernetes operator for MySQL NDB Cluster.
//!
//! Startup order matters here: the health server comes up first so probes
//! answer while this replica waits for the leadership lease, and the
//! controller starts only once the lease is held. Losing the lease exits
//! the process; the pod restart re-enters the election.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ndb_operator::health::{run_health_server, HealthState};
use ndb_operator::run_controller;

const LEASE_NAME: &str = "ndb-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight sync ticks to complete during shutdown.
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ndb_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    // WATCH_NAMESPACE restricts the operator to a single namespace; unset
    // means cluster-wide. Matches the deployment manifests, which set it
    // for namespace-scoped installs.
    let watch_namespace = std::env::var("WATCH_NAMESPACE").ok();
    info!(
        scope = watch_namespace.as_deref().unwrap_or("cluster-wide"),
        in_cluster = std::env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        "Starting ndb-operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let holder_id = leadership_holder_id();
    let lease_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, keeping the leadership lease in 'default'");
        "default".to_string()
    });

    let health_state = Arc::new(HealthState::new());

    // Probes must answer before leadership is held, so the health server
    // starts first.
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server error");
            }
        })
    };

    info!(
        holder_id = %holder_id,
        namespace = %lease_namespace,
        lease_name = LEASE_NAME,
        "Waiting to acquire leadership"
    );
    let lease_lock = new_lease_lock(&client, &lease_namespace, &holder_id);
    wait_for_leadership(&lease_lock).await;

    let renewal_handle = spawn_lease_renewal(new_lease_lock(&client, &lease_namespace, &holder_id));

    let controller_handle = {
        let health_state = health_state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            run_controller(client, Some(health_state), watch_namespace.as_deref()).await;
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        // The renewal task exits the whole process on lease loss, so this
        // arm is only reached on panic.
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown");
            health_state.set_ready(false);

            // In-flight ticks finish their current remote call and unwind.
            info!(
                grace_secs = SHUTDOWN_GRACE_PERIOD_SECS,
                "Waiting for in-flight sync ticks to complete"
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Identity this replica acquires the lease under: the pod name, or the
/// machine hostname when running outside a pod (e.g. against a remote
/// cluster during development).
fn leadership_holder_id() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| {
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "ndb-operator".to_string())
    })
}

fn new_lease_lock(client: &Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until this replica holds the leadership lease.
async fn wait_for_leadership(lease_lock: &LeaseLock) {
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance is leader, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }
}

/// Keep renewing the lease in the background. Losing it means another
/// replica may already be reconciling, so this process exits immediately
/// rather than risk two operators driving the same MySQL Cluster.
fn spawn_lease_renewal(lease_lock: LeaseLock) -> JoinHandle<()> {
    #[allow(clippy::exit)]
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

            match lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership, shutting down");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease, shutting down");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Resolve on SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
