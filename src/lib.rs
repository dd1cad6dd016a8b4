//! ndb-operator library crate
//!
//! Exports the NdbCluster controller, the CRD definitions, cluster config
//! generation, the management protocol client and the resource generators.

pub mod controller;
pub mod crd;
pub mod health;
pub mod mgmapi;
pub mod mysqlclient;
pub mod ndbconfig;
pub mod resources;

pub use health::HealthState;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{metadata_watcher, predicates, reflector, watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::reconciler::{error_policy, reconcile};
use crd::NdbCluster;

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run the NdbCluster controller until the process exits.
///
/// With `watch_namespace` set the operator manages only that namespace,
/// mirroring a namespace-scoped deployment; otherwise it watches
/// cluster-wide.
pub async fn run_controller(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    watch_namespace: Option<&str>,
) {
    info!(
        scope = watch_namespace.unwrap_or("cluster-wide"),
        "Starting NdbCluster controller"
    );

    let ctx = Arc::new(Context::new(client.clone(), health_state.clone()));

    // any_semantic: resync from whatever resource version the API server
    // still has, instead of failing the watch on a stale one.
    let watcher_config = WatcherConfig::default().any_semantic();

    // The trigger stream drops status-only updates via the generation
    // predicate. That matters here: every tick of a config rollout writes
    // status, and reacting to those writes would double every rollout
    // pass. Requeues carry the rollout forward instead.
    let ndbclusters: Api<NdbCluster> = api_for(&client, watch_namespace);
    let (store, writer) = reflector::store();
    let ndbcluster_stream = reflector(writer, watcher(ndbclusters, watcher_config.clone()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);

    // The reconciler reads StatefulSet status (rollout completion, ready
    // replicas), so those are watched in full. Services, the config map,
    // secrets and the PDB only gate on existence and spec changes;
    // metadata watches are enough and keep the cache small.
    let statefulsets: Api<StatefulSet> = api_for(&client, watch_namespace);
    let services: Api<Service> = api_for(&client, watch_namespace);
    let configmaps: Api<ConfigMap> = api_for(&client, watch_namespace);
    let secrets: Api<Secret> = api_for(&client, watch_namespace);
    let pdbs: Api<PodDisruptionBudget> = api_for(&client, watch_namespace);

    if let Some(ref state) = health_state {
        state.set_ready(true);
    }

    Controller::for_stream(ndbcluster_stream, store)
        .owns(statefulsets, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config.clone()).touched_objects())
        .owns_stream(metadata_watcher(configmaps, watcher_config.clone()).touched_objects())
        .owns_stream(metadata_watcher(secrets, watcher_config.clone()).touched_objects())
        .owns_stream(metadata_watcher(pdbs, watcher_config).touched_objects())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((ndb, _action)) => {
                    debug!(name = %ndb.name, "Reconciled NdbCluster");
                }
                Err(e) => log_controller_error(&e),
            }
        })
        .await;

    // The watch streams retry internally; reaching this point means the
    // controller future itself ended.
    error!("NdbCluster controller stream ended unexpectedly");
}

/// Log a controller-level error. Reconciliations triggered for an
/// NdbCluster that was just deleted surface as not-found errors; those are
/// expected and stay at debug level.
fn log_controller_error(error: &kube::runtime::controller::Error<controller::error::Error, watcher::Error>) {
    use kube::runtime::controller::Error as ControllerError;

    let is_not_found = match error {
        ControllerError::ObjectNotFound(_) => true,
        ControllerError::ReconcilerFailed(err, _) => err.is_not_found(),
        _ => false,
    };
    if is_not_found {
        debug!(error = ?error, "NdbCluster no longer exists");
    } else {
        error!(error = ?error, "Reconciliation error");
    }
}
