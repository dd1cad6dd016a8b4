//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Serves `/healthz` (liveness), `/readyz` (readiness, true once leadership
//! is held and the controller runs) and `/metrics`. The metrics mirror the
//! shape of the sync loop: tick counters and durations per NdbCluster, the
//! config generation currently stored for it, and desired/ready node counts
//! per MySQL Cluster node type.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tracing::info;

use crate::crd::NdbNodeType;

/// Port the probe and metrics endpoints listen on.
const HEALTH_PORT: u16 = 8080;

/// Labels identifying one NdbCluster.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SyncLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for SyncLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels identifying one node type of one NdbCluster.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct NodeTypeLabels {
    pub namespace: String,
    pub name: String,
    pub node_type: &'static str,
}

impl EncodeLabelSet for NodeTypeLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("node_type", self.node_type).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Metrics exported by the operator.
pub struct Metrics {
    sync_ticks_total: Family<SyncLabels, Counter>,
    sync_errors_total: Family<SyncLabels, Counter>,
    sync_duration_seconds: Family<SyncLabels, Histogram>,
    config_generation: Family<SyncLabels, Gauge>,
    nodes_desired: Family<NodeTypeLabels, Gauge>,
    nodes_ready: Family<NodeTypeLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sync_ticks_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "ndboperator_sync_ticks",
            "Total number of sync ticks per NdbCluster",
            sync_ticks_total.clone(),
        );

        let sync_errors_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "ndboperator_sync_errors",
            "Total number of failed sync ticks per NdbCluster",
            sync_errors_total.clone(),
        );

        // A tick normally ends within a few round trips to the API server
        // and the management server. The top buckets (~500s) exist so a
        // tick stuck past the 300s threshold stands out.
        let sync_duration_seconds = Family::<SyncLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 20))
        });
        registry.register(
            "ndboperator_sync_duration_seconds",
            "Duration of sync ticks in seconds",
            sync_duration_seconds.clone(),
        );

        let config_generation = Family::<SyncLabels, Gauge>::default();
        registry.register(
            "ndboperator_config_generation",
            "Config generation currently stored for the NdbCluster",
            config_generation.clone(),
        );

        let nodes_desired = Family::<NodeTypeLabels, Gauge>::default();
        registry.register(
            "ndboperator_nodes_desired",
            "Desired node count per MySQL Cluster node type",
            nodes_desired.clone(),
        );

        let nodes_ready = Family::<NodeTypeLabels, Gauge>::default();
        registry.register(
            "ndboperator_nodes_ready",
            "Ready node count per MySQL Cluster node type",
            nodes_ready.clone(),
        );

        Self {
            sync_ticks_total,
            sync_errors_total,
            sync_duration_seconds,
            config_generation,
            nodes_desired,
            nodes_ready,
            registry,
        }
    }

    /// Record a completed sync tick.
    pub fn record_tick(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = SyncLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.sync_ticks_total.get_or_create(&labels).inc();
        self.sync_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed sync tick.
    pub fn record_error(&self, namespace: &str, name: &str) {
        let labels = SyncLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.sync_errors_total.get_or_create(&labels).inc();
    }

    /// Publish the config generation the stored cluster config carries.
    pub fn set_config_generation(&self, namespace: &str, name: &str, generation: i64) {
        let labels = SyncLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.config_generation.get_or_create(&labels).set(generation);
    }

    /// Publish desired and ready counts for one node type.
    pub fn set_node_counts(
        &self,
        namespace: &str,
        name: &str,
        node_type: NdbNodeType,
        desired: i64,
        ready: i64,
    ) {
        let labels = NodeTypeLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            node_type: node_type.as_str(),
        };
        self.nodes_desired.get_or_create(&labels).set(desired);
        self.nodes_ready.get_or_create(&labels).set(ready);
    }

    /// Encode metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server.
pub struct HealthState {
    /// True once this replica holds the leadership lease and the
    /// controller is running.
    ready: AtomicBool,
    /// Unix timestamp of the last completed sync tick, across all
    /// NdbClusters.
    last_tick: AtomicI64,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready).
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            last_tick: AtomicI64::new(0),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready or not ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the operator is ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Note that a sync tick just completed.
    pub fn mark_tick(&self) {
        self.last_tick
            .store(jiff::Timestamp::now().as_second(), Ordering::Relaxed);
    }

    /// Unix timestamp of the last completed sync tick, 0 before the first.
    pub fn last_tick(&self) -> i64 {
        self.last_tick.load(Ordering::Relaxed)
    }
}

/// Liveness probe: if the server answers, the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: ready once leadership is held and the controller runs.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on [`HEALTH_PORT`] until the process exits.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
