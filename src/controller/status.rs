//! Status projection for the NdbCluster resource.
//!
//! Derives the user-visible readiness strings and the UpToDate condition
//! from the observed workloads, and writes the status subresource with
//! optimistic concurrency.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::controller::error::{Error, Result};
use crate::crd::{
    NdbCluster, NdbClusterCondition, NdbClusterStatus, REASON_ERROR, REASON_ISR,
    REASON_SPEC_UPDATE_IN_PROGRESS, REASON_SYNC_SUCCESS,
};
use crate::resources::common::all_pods_selector;

/// Bounded retry budget for status writes hitting a conflict.
const MAX_STATUS_UPDATE_ATTEMPTS: u32 = 5;

/// Container waiting reasons that mark a pod as failing.
const FAILING_CONTAINER_REASONS: [&str; 6] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "CreateContainerError",
    "InvalidImageName",
];

fn ready_replicas(sfset: Option<&StatefulSet>) -> i32 {
    sfset
        .and_then(|s| s.status.as_ref())
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Build the status for the NdbCluster from the observed workloads.
///
/// `sync_success` means the spec has been verified to be fully applied to
/// the MySQL Cluster; only then does `processedGeneration` advance.
pub fn calculate_status(
    ndb: &NdbCluster,
    mgmd_sfset: Option<&StatefulSet>,
    ndbd_sfset: Option<&StatefulSet>,
    mysqld_sfset: Option<&StatefulSet>,
    sync_success: bool,
    pod_errors: &[String],
) -> NdbClusterStatus {
    let mut status = NdbClusterStatus {
        ready_management_nodes: format!(
            "Ready:{}/{}",
            ready_replicas(mgmd_sfset),
            ndb.get_management_node_count()
        ),
        ready_data_nodes: format!(
            "Ready:{}/{}",
            ready_replicas(ndbd_sfset),
            ndb.spec.node_count
        ),
        ready_mysql_servers: format!(
            "Ready:{}/{}",
            ready_replicas(mysqld_sfset),
            ndb.get_mysql_server_node_count()
        ),
        ..Default::default()
    };

    // Report the generated secret only once the MySQL Servers exist.
    if mysqld_sfset.is_some() && ndb.get_mysql_server_node_count() > 0 {
        let (secret_name, custom) = ndb.get_root_password_secret_name();
        if !custom {
            status.generated_root_password_secret_name = Some(secret_name);
        }
    }

    let generation = ndb.metadata.generation.unwrap_or(0);
    let condition = if sync_success {
        status.processed_generation = generation;
        NdbClusterCondition::up_to_date(
            true,
            REASON_SYNC_SUCCESS,
            &format!(
                "NdbCluster spec generation {generation} was successfully applied to the MySQL Cluster"
            ),
        )
    } else {
        // The sync is still ongoing; keep the previously processed generation.
        status.processed_generation = ndb
            .status
            .as_ref()
            .map_or(0, |s| s.processed_generation);

        if !pod_errors.is_empty() {
            NdbClusterCondition::up_to_date(false, REASON_ERROR, &pod_errors.join("\n"))
        } else if generation == 1 {
            NdbClusterCondition::up_to_date(false, REASON_ISR, "MySQL Cluster is starting up")
        } else {
            NdbClusterCondition::up_to_date(
                false,
                REASON_SPEC_UPDATE_IN_PROGRESS,
                &format!(
                    "NdbCluster spec generation {generation} is being applied to the MySQL Cluster"
                ),
            )
        }
    };
    status.conditions.push(condition);

    status
}

/// Compare two statuses, ignoring condition timestamps.
pub fn status_equal(old: &NdbClusterStatus, new: &NdbClusterStatus) -> bool {
    let conditions_equal = match (old.conditions.first(), new.conditions.first()) {
        (Some(a), Some(b)) => {
            a.status == b.status && a.reason == b.reason && a.message == b.message
        }
        (None, None) => true,
        _ => false,
    };

    old.processed_generation == new.processed_generation
        && old.ready_management_nodes == new.ready_management_nodes
        && old.ready_data_nodes == new.ready_data_nodes
        && old.ready_mysql_servers == new.ready_mysql_servers
        && old.generated_root_password_secret_name == new.generated_root_password_secret_name
        && conditions_equal
}

/// Collect messages for owned pods stuck in a failing state.
pub async fn retrieve_pod_errors(client: Client, ndb: &NdbCluster) -> Result<Vec<String>> {
    let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
    let pod_api: Api<Pod> = Api::namespaced(client, &namespace);
    let pods = pod_api
        .list(&ListParams::default().labels(&all_pods_selector(ndb)))
        .await?;

    let mut errors = Vec::new();
    for pod in pods {
        let pod_name = pod.name_any();
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        for cs in statuses.into_iter().flatten() {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if let Some(reason) = waiting.reason.as_deref() {
                    if FAILING_CONTAINER_REASONS.contains(&reason) {
                        errors.push(format!("Pod {namespace}/{pod_name} : {reason}"));
                    }
                }
            }
        }
    }

    Ok(errors)
}

/// Write the status subresource, re-reading and retrying on optimistic
/// concurrency conflicts with bounded exponential backoff.
pub async fn update_status(client: Client, ndb: &NdbCluster, status: NdbClusterStatus) -> Result<()> {
    let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
    let name = ndb.name_any();
    let api: Api<NdbCluster> = Api::namespaced(client, &namespace);

    let mut backoff = Duration::from_millis(100);
    for attempt in 1..=MAX_STATUS_UPDATE_ATTEMPTS {
        let mut latest = api.get(&name).await?;
        latest.status = Some(status.clone());

        match api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&latest)?)
            .await
        {
            Ok(_) => {
                info!(
                    name = %name,
                    processed_generation = status.processed_generation,
                    "Updated NdbCluster status"
                );
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < MAX_STATUS_UPDATE_ATTEMPTS => {
                warn!(name = %name, attempt, "Conflict updating status, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::Internal(format!(
        "status update for {name} kept conflicting after {MAX_STATUS_UPDATE_ATTEMPTS} attempts"
    )))
}
