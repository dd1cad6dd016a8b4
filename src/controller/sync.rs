//! The per-tick sync state machine.
//!
//! A complete sync of an NdbCluster takes place over many reconciliations.
//! Each tick walks the same ordered steps; a step either lets the tick fall
//! through, finishes it, or requeues it. The stored ConfigMap is the only
//! state carried between ticks: it records what the operator last tried to
//! apply, while the spec records what the user wants.
//!
//! Rollout ordering per tick: MySQL Servers scale down first (they must
//! release API sections before the config may drop them), then management
//! servers restart one at a time, then data nodes restart at most one per
//! node group per tick.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{ListParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{info, warn};

use crate::controller::context::{Context, REASON_IN_SYNC, REASON_SYNC_SUCCESS};
use crate::controller::error::{Error, Result};
use crate::controller::status::{
    calculate_status, retrieve_pod_errors, status_equal, update_status,
};
use crate::controller::sync_result::{
    continue_processing, finish_processing, requeue_in_seconds, StepResult,
};
use crate::controller::validation::{has_valid_spec, is_valid_spec_update};
use crate::controller::workloads::{
    MgmdController, MysqldController, NdbdController, WorkloadControl,
};
use crate::crd::{NdbCluster, NdbNodeType, NDB_PORT};
use crate::mgmapi::{ClusterStatus, MgmClient};
use crate::ndbconfig::generator::normalized_my_cnf;
use crate::ndbconfig::summary::my_cnf_body;
use crate::ndbconfig::{
    calculate_spec_hash, generate_config_text, generate_my_cnf, resolve_hostname_suffix,
    ConfigSummary,
};
use crate::resources::common::all_pods_selector;
use crate::resources::configmap::{get_config_from_config_map, new_config_map};
use crate::resources::pdb::new_pod_disruption_budget;
use crate::resources::services::{new_service, service_address_and_port, service_name};
use crate::resources::statefulset::desired_replicas;

/// All state resolved for a single reconciliation of one NdbCluster.
pub struct SyncContext<'a> {
    ctx: &'a Context,
    ndb: &'a NdbCluster,
    namespace: String,

    mgmd_controller: MgmdController,
    ndbd_controller: NdbdController,
    mysqld_controller: MysqldController,

    config_summary: Option<ConfigSummary>,
    stored_config_ini: Option<String>,
    stored_my_cnf: Option<String>,

    mgmd_sfset: Option<StatefulSet>,
    ndbd_sfset: Option<StatefulSet>,
    mysqld_sfset: Option<StatefulSet>,

    /// Address of the management LoadBalancer service, used when the
    /// operator runs outside the cluster.
    management_address: Option<(String, i32)>,
    cluster_state: Option<ClusterStatus>,
}

impl<'a> SyncContext<'a> {
    pub fn new(ctx: &'a Context, ndb: &'a NdbCluster) -> Self {
        let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
        Self {
            ctx,
            ndb,
            namespace,
            mgmd_controller: MgmdController,
            ndbd_controller: NdbdController,
            mysqld_controller: MysqldController,
            config_summary: None,
            stored_config_ini: None,
            stored_my_cnf: None,
            mgmd_sfset: None,
            ndbd_sfset: None,
            mysqld_sfset: None,
            management_address: None,
            cluster_state: None,
        }
    }

    /// Drive the MySQL Cluster one step closer to the NdbCluster spec.
    pub async fn sync(mut self) -> StepResult {
        if let Err(e) = has_valid_spec(self.ndb) {
            self.ctx
                .publish_warning_event(self.ndb, "InvalidSpec", "Validate", Some(e.to_string()))
                .await;
            return Err(e);
        }

        // Create any missing resources. The stored config, not the spec,
        // decides their shape, so a partially applied change continues
        // from where it left off.
        let sr = self.ensure_all_resources().await?;
        if sr.stops_sync() {
            return Ok(sr);
        }

        let Some(summary) = self.config_summary.clone() else {
            return Err(Error::Internal(
                "config summary missing after resource ensure".to_string(),
            ));
        };

        // Enforce the update rules a validating webhook would apply,
        // using the stored config as the authoritative previous state.
        if let Err(e) = is_valid_spec_update(self.ndb, &summary) {
            self.ctx
                .publish_warning_event(
                    self.ndb,
                    "InvalidSpecUpdate",
                    "Validate",
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }

        // Config changes cannot be processed until all pods are ready.
        let sr = self.check_pods_readiness().await?;
        if sr.stops_sync() {
            // Surface pod failures (image pull errors, crash loops) in the
            // condition while waiting.
            self.update_ndb_cluster_status(false).await;
            return Ok(sr);
        }

        let cluster_state = self.retrieve_cluster_status().await?;
        if !cluster_state.is_healthy() {
            info!("Some MySQL Cluster nodes are not ready yet");
            return requeue_in_seconds(5);
        }
        self.cluster_state = Some(cluster_state);

        // First pass of MySQL Server reconciliation: scale down before the
        // number of API sections in the config may shrink.
        let sr = self
            .mysqld_controller
            .handle_scale_down(self.ctx, self.ndb, &summary, self.mysqld_sfset.as_ref())
            .await?;
        if sr.stops_sync() {
            return Ok(sr);
        }

        let sr = self.ensure_management_server_config_version(&summary).await?;
        if sr.stops_sync() {
            return Ok(sr);
        }

        let sr = self.ensure_data_node_config_version(&summary).await?;
        if sr.stops_sync() {
            return Ok(sr);
        }

        // The cluster runs the stored config now. Align the management and
        // data workload objects with it (replica count, image).
        if let Some(observed) = self.mgmd_sfset.clone() {
            if let Some(patched) = self
                .mgmd_controller
                .patch_if_drifted(self.ctx, self.ndb, &summary, &observed)
                .await?
            {
                self.mgmd_sfset = Some(patched);
            }
        }
        if let Some(observed) = self.ndbd_sfset.clone() {
            if let Some(patched) = self
                .ndbd_controller
                .patch_if_drifted(self.ctx, self.ndb, &summary, &observed)
                .await?
            {
                self.ndbd_sfset = Some(patched);
            }
        }

        // Second pass of MySQL Server reconciliation.
        let sr = self
            .mysqld_controller
            .reconcile_statefulset(self.ctx, self.ndb, &summary, self.mysqld_sfset.as_ref())
            .await?;
        if sr.stops_sync() {
            return Ok(sr);
        }

        let sr = self
            .mysqld_controller
            .reconcile_root_user(self.ctx, self.ndb, self.mysqld_sfset.as_ref())
            .await?;
        if sr.stops_sync() {
            return Ok(sr);
        }

        // The MySQL Cluster is in sync with the stored config. Check
        // whether the spec has moved on and persist the next generation.
        let has_pending_config_changes = self.diff_and_persist_spec(&summary).await?;

        self.record_cluster_metrics(&summary);
        self.update_ndb_cluster_status(!has_pending_config_changes)
            .await;

        if has_pending_config_changes {
            // The new config starts rolling out on the next tick.
            return requeue_in_seconds(0);
        }

        finish_processing()
    }

    // ---- resource creation -------------------------------------------------

    async fn ensure_all_resources(&mut self) -> StepResult {
        let mut all_existed = true;

        let services = [
            (NdbNodeType::Mgmd, false),
            (NdbNodeType::Mgmd, true),
            (NdbNodeType::Ndbd, false),
            (NdbNodeType::Mysqld, false),
            (NdbNodeType::Mysqld, true),
        ];
        for (node_type, load_balancer) in services {
            let (svc, existed) = self.ensure_service(node_type, load_balancer).await?;
            if node_type == NdbNodeType::Mgmd && load_balancer {
                self.management_address = service_address_and_port(&svc);
            }
            all_existed &= existed;
        }

        all_existed &= self.ensure_pod_disruption_budget().await?;

        let (cm, existed) = self.ensure_config_map().await?;
        all_existed &= existed;

        let (config_ini, my_cnf) = get_config_from_config_map(&cm);
        let Some(config_ini) = config_ini else {
            return Err(Error::Internal(format!(
                "config map {} carries no config.ini",
                self.ndb.get_config_map_name()
            )));
        };
        // The operator generated this config; failing to parse it back is
        // a hard error.
        let summary = ConfigSummary::from_config_text(config_ini, my_cnf.map(String::as_str))?;
        self.stored_config_ini = Some(config_ini.clone());
        self.stored_my_cnf = my_cnf.cloned();
        self.config_summary = Some(summary.clone());

        let (sfset, existed) = self
            .mgmd_controller
            .ensure(self.ctx, self.ndb, &summary)
            .await?;
        self.mgmd_sfset = Some(sfset);
        all_existed &= existed;

        let (sfset, existed) = self
            .ndbd_controller
            .ensure(self.ctx, self.ndb, &summary)
            .await?;
        self.ndbd_sfset = Some(sfset);
        all_existed &= existed;

        // The MySQL Server StatefulSet is created later, only if required;
        // here just verify that an existing one is actually ours.
        self.mysqld_sfset = self.mysqld_controller.get_owned(self.ctx, self.ndb).await?;

        if all_existed {
            continue_processing()
        } else {
            info!("Some resources were just created, waiting for them to become ready");
            requeue_in_seconds(5)
        }
    }

    async fn ensure_service(
        &self,
        node_type: NdbNodeType,
        load_balancer: bool,
    ) -> Result<(Service, bool)> {
        let api: Api<Service> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let name = service_name(self.ndb, node_type, load_balancer);

        if let Some(svc) = api.get_opt(&name).await? {
            return Ok((svc, true));
        }

        info!(service = %name, "Creating Service");
        let svc = api
            .create(
                &PostParams::default(),
                &new_service(self.ndb, node_type, load_balancer),
            )
            .await?;
        Ok((svc, false))
    }

    async fn ensure_pod_disruption_budget(&self) -> Result<bool> {
        let api: Api<k8s_openapi::api::policy::v1::PodDisruptionBudget> =
            Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let name = self.ndb.get_pod_disruption_budget_name();

        if api.get_opt(&name).await?.is_some() {
            return Ok(true);
        }

        info!(pdb = %name, "Creating PodDisruptionBudget for the data nodes");
        api.create(&PostParams::default(), &new_pod_disruption_budget(self.ndb))
            .await?;
        Ok(false)
    }

    async fn ensure_config_map(&self) -> Result<(ConfigMap, bool)> {
        let api: Api<ConfigMap> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let name = self.ndb.get_config_map_name();

        if let Some(cm) = api.get_opt(&name).await? {
            return Ok((cm, true));
        }

        let suffix = resolve_hostname_suffix(&self.namespace).await;
        let config_ini = generate_config_text(self.ndb, None, &suffix)?;
        let my_cnf = generate_my_cnf(self.ndb, None);

        info!(config_map = %name, "Creating ConfigMap with the initial cluster config");
        let cm = api
            .create(
                &PostParams::default(),
                &new_config_map(self.ndb, config_ini, my_cnf),
            )
            .await?;
        Ok((cm, false))
    }

    // ---- readiness and health ----------------------------------------------

    /// The sync continues only when every pod owned by the NdbCluster is
    /// ready.
    async fn check_pods_readiness(&self) -> StepResult {
        let pod_api: Api<Pod> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let pods = pod_api
            .list(&ListParams::default().labels(&all_pods_selector(self.ndb)))
            .await?;

        for pod in &pods {
            let ready = pod
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
                .is_some_and(|c| c.status == "True");
            if !ready {
                info!(pod = %pod.name_any(), "Pod is not ready yet, requeueing");
                return requeue_in_seconds(5);
            }
        }

        continue_processing()
    }

    /// Connect to a specific management server. Inside the cluster the
    /// desired node's pod is addressed directly; outside, the LoadBalancer
    /// service is used and the connector retries until it lands on the
    /// desired node.
    async fn connect_to_management_server(&self, node_id: i32) -> Result<Box<dyn MgmClient>> {
        let connectstring = if self.ctx.running_inside_k8s {
            let pod_name = format!(
                "{}-{}",
                self.ndb.get_workload_name(NdbNodeType::Mgmd),
                node_id - 1
            );
            let pod_api: Api<Pod> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
            let pod = pod_api.get(&pod_name).await?;
            let pod_ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .ok_or(Error::Mgm(crate::mgmapi::MgmError::NodeUnreachable(node_id)))?;
            format!("{pod_ip}:{NDB_PORT}")
        } else {
            let (address, port) = self.management_address.clone().ok_or_else(|| {
                Error::Internal("management LoadBalancer address not resolved".to_string())
            })?;
            format!("{address}:{port}")
        };

        Ok(self
            .ctx
            .mgm_connector
            .connect(&connectstring, node_id)
            .await?)
    }

    async fn retrieve_cluster_status(&self) -> Result<ClusterStatus> {
        let mut client = self.connect_to_management_server(1).await?;
        let status = client.get_status().await;
        let _ = client.end_session().await;
        Ok(status?)
    }

    // ---- config version rollout --------------------------------------------

    /// Restart management servers that run an outdated config, one at a
    /// time. The StatefulSet restarts a stopped server with the new config.
    async fn ensure_management_server_config_version(
        &self,
        summary: &ConfigSummary,
    ) -> StepResult {
        let wanted_generation = summary.config_generation;
        info!(
            wanted_generation,
            "Ensuring management servers have the desired config version"
        );

        for node_id in 1..=self.ndb.get_management_node_count() {
            let mut client = self.connect_to_management_server(node_id).await?;
            let version = client.get_config_version(None).await?;

            if version == wanted_generation {
                let _ = client.end_session().await;
                continue;
            }

            info!(
                node_id,
                version, wanted_generation, "Management server has an outdated config, stopping it"
            );
            // The session may drop while the server shuts down.
            if let Err(e) = client.stop_nodes(&[node_id]).await {
                warn!(node_id, error = %e, "Error stopping management node");
            }
            let _ = client.end_session().await;

            // Only one management restart at a time; the rest is handled
            // in later reconciliations.
            return requeue_in_seconds(5);
        }

        info!("All management nodes have the desired config version");
        continue_processing()
    }

    /// Restart data nodes that run an outdated config without reducing
    /// availability: per pass, at most one node of every node group is
    /// stopped, and the next pass starts only after they came back.
    async fn ensure_data_node_config_version(&self, summary: &ConfigSummary) -> StepResult {
        let wanted_generation = summary.config_generation;
        let redundancy_level = summary.redundancy_level;

        let groups = self
            .cluster_state
            .as_ref()
            .and_then(ClusterStatus::nodes_grouped_by_nodegroup)
            .ok_or_else(|| {
                Error::Internal(
                    "could not extract nodes and node groups from cluster status".to_string(),
                )
            })?;

        let mut client = self.connect_to_management_server(1).await?;

        for pass in 0..redundancy_level.max(0) as usize {
            let candidates = rollout_candidates(&groups, pass);

            let mut nodes_with_old_config = Vec::new();
            for node_id in candidates {
                let version = client.get_config_version(Some(node_id)).await?;
                if version != wanted_generation {
                    nodes_with_old_config.push(node_id);
                }
            }

            if !nodes_with_old_config.is_empty() {
                info!(
                    nodes = ?nodes_with_old_config,
                    wanted_generation, "Stopping data nodes with an outdated config"
                );
                client.stop_nodes(&nodes_with_old_config).await?;
                let _ = client.end_session().await;

                // Let the StatefulSet bring them back before touching the
                // next set, so no node group ever loses two members.
                return requeue_in_seconds(5);
            }
        }

        let _ = client.end_session().await;
        info!("All data nodes have the desired config version");
        continue_processing()
    }

    // ---- spec diff and status ----------------------------------------------

    /// Compare the spec with the stored config and persist a regenerated
    /// config when they diverge. Cluster-config changes bump the config
    /// generation; my.cnf-only changes bump just the my.cnf generation.
    async fn diff_and_persist_spec(&self, summary: &ConfigSummary) -> Result<bool> {
        let new_hash = calculate_spec_hash(self.ndb)?;
        let config_changed = new_hash != summary.config_hash;

        let desired_my_cnf = self
            .ndb
            .get_my_cnf()
            .map(|cnf| normalized_my_cnf(cnf).trim().to_string());
        let stored_my_cnf = self.stored_my_cnf.as_deref().map(my_cnf_body);
        let my_cnf_changed = desired_my_cnf != stored_my_cnf;

        if !config_changed && !my_cnf_changed {
            return Ok(false);
        }

        info!(
            config_changed,
            my_cnf_changed, "NdbCluster spec differs from the stored config, regenerating"
        );

        let config_ini = if config_changed {
            let suffix = resolve_hostname_suffix(&self.namespace).await;
            generate_config_text(self.ndb, Some(summary), &suffix)?
        } else {
            self.stored_config_ini.clone().ok_or_else(|| {
                Error::Internal("stored config text missing during diff".to_string())
            })?
        };

        let my_cnf = if my_cnf_changed {
            generate_my_cnf(self.ndb, Some(summary))
        } else {
            self.stored_my_cnf.clone()
        };

        let api: Api<ConfigMap> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        api.replace(
            &self.ndb.get_config_map_name(),
            &PostParams::default(),
            &new_config_map(self.ndb, config_ini, my_cnf),
        )
        .await?;

        Ok(true)
    }

    /// Publish the per-cluster gauges: the stored config generation and
    /// the desired/ready counts of every node type.
    fn record_cluster_metrics(&self, summary: &ConfigSummary) {
        let Some(health_state) = self.ctx.health_state.as_ref() else {
            return;
        };

        let name = self.ndb.name_any();
        let metrics = &health_state.metrics;
        metrics.set_config_generation(
            &self.namespace,
            &name,
            i64::from(summary.config_generation),
        );

        let workloads = [
            (NdbNodeType::Mgmd, self.mgmd_sfset.as_ref()),
            (NdbNodeType::Ndbd, self.ndbd_sfset.as_ref()),
            (NdbNodeType::Mysqld, self.mysqld_sfset.as_ref()),
        ];
        for (node_type, sfset) in workloads {
            let ready = sfset
                .and_then(|s| s.status.as_ref())
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            metrics.set_node_counts(
                &self.namespace,
                &name,
                node_type,
                i64::from(desired_replicas(summary, node_type)),
                i64::from(ready),
            );
        }
    }

    /// Project and write the status. A failed status write does not fail
    /// the tick: the work it reports already happened.
    ///
    /// `sync_success` is true only when the spec has been verified to be
    /// fully applied to the MySQL Cluster.
    async fn update_ndb_cluster_status(&self, sync_success: bool) {
        let pod_errors = match retrieve_pod_errors(self.ctx.client.clone(), self.ndb).await {
            Ok(errors) => errors,
            Err(e) => {
                warn!(error = %e, "Failed to inspect pods for the status condition");
                Vec::new()
            }
        };

        let new_status = calculate_status(
            self.ndb,
            self.mgmd_sfset.as_ref(),
            self.ndbd_sfset.as_ref(),
            self.mysqld_sfset.as_ref(),
            sync_success,
            &pod_errors,
        );

        if self
            .ndb
            .status
            .as_ref()
            .is_some_and(|old| status_equal(old, &new_status))
        {
            if sync_success {
                // Nothing happened in this loop
                self.ctx
                    .publish_normal_event(
                        self.ndb,
                        REASON_IN_SYNC,
                        "Sync",
                        Some("MySQL Cluster is in sync with the NdbCluster spec".to_string()),
                    )
                    .await;
            }
            return;
        }

        match update_status(self.ctx.client.clone(), self.ndb, new_status).await {
            Ok(()) => {
                if sync_success {
                    self.ctx
                        .publish_normal_event(
                            self.ndb,
                            REASON_SYNC_SUCCESS,
                            "Sync",
                            Some(
                                "MySQL Cluster was successfully synced with the NdbCluster spec"
                                    .to_string(),
                            ),
                        )
                        .await;
                }
            }
            Err(e) => {
                // Retried on the next event; the applied work stands.
                warn!(error = %e, "Failed to update NdbCluster status");
            }
        }
    }
}

/// The i-th member of every node group, the candidate set of one rollout
/// pass. Taking one member per group keeps every group quorate.
pub fn rollout_candidates(groups: &[Vec<i32>], pass: usize) -> Vec<i32> {
    groups
        .iter()
        .filter_map(|group| group.get(pass).copied())
        .collect()
}
