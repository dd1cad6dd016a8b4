//! Workload controllers for the three MySQL Cluster node types.
//!
//! The controllers share one contract: ensure the StatefulSet exists, patch
//! it when it drifts from the stored config, report rollout completion and
//! tear it down. The MySQL Server controller additionally owns scale-down
//! handling (which must precede any config rollout) and the root user.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{error, info};

use crate::controller::context::{Context, FIELD_MANAGER, REASON_RESOURCE_EXISTS};
use crate::controller::error::{Error, Result};
use crate::controller::sync_result::{continue_processing, finish_processing, StepResult};
use crate::crd::{NdbCluster, NdbNodeType};
use crate::mysqlclient;
use crate::ndbconfig::ConfigSummary;
use crate::resources::common::{
    is_owned_by, LAST_APPLIED_CONFIG_GENERATION, ROOT_HOST_ANNOTATION,
    ROOT_PASSWORD_SECRET_ANNOTATION, ROOT_USER_GENERATION_ANNOTATION,
};
use crate::resources::secret::new_root_password_secret;
use crate::resources::statefulset::{new_statefulset, pod_template_hash};

/// True when the StatefulSet has completely rolled out its current spec:
/// the controller has observed the latest generation and every desired
/// replica is updated, ready and not terminating.
pub fn rollout_complete(sfset: &StatefulSet) -> bool {
    let Some(status) = sfset.status.as_ref() else {
        return false;
    };
    let desired = sfset.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);

    sfset.metadata.generation == status.observed_generation
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        // current count includes pods still terminating
        && status.replicas == desired
}

/// Compare the parts of a StatefulSet the operator manages: image, replica
/// count and the applied pod template (via its recorded hash).
pub fn workload_drifted(observed: &StatefulSet, desired: &StatefulSet) -> bool {
    fn image(sfset: &StatefulSet) -> Option<&String> {
        sfset
            .spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .first()?
            .image
            .as_ref()
    }
    fn replicas(sfset: &StatefulSet) -> Option<i32> {
        sfset.spec.as_ref()?.replicas
    }
    fn template_hash(sfset: &StatefulSet) -> Option<&String> {
        sfset
            .metadata
            .annotations
            .as_ref()?
            .get(LAST_APPLIED_CONFIG_GENERATION)
    }

    image(observed) != image(desired)
        || replicas(observed) != replicas(desired)
        || template_hash(observed) != template_hash(desired)
}

/// The shared contract of the per-node-type StatefulSet controllers.
#[async_trait]
pub trait WorkloadControl: Send + Sync {
    /// The node type this controller manages.
    fn node_type(&self) -> NdbNodeType;

    /// Extra StatefulSet annotations recorded at build time.
    fn extra_annotations(&self, _ndb: &NdbCluster) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Build the desired StatefulSet from the stored config summary,
    /// recording the pod template hash for drift detection.
    fn new_workload(&self, ndb: &NdbCluster, summary: &ConfigSummary) -> StatefulSet {
        let mut sfset = new_statefulset(ndb, summary, self.node_type());

        let mut annotations = self.extra_annotations(ndb);
        if let Some(spec) = sfset.spec.as_ref() {
            annotations.insert(
                LAST_APPLIED_CONFIG_GENERATION.to_string(),
                pod_template_hash(&spec.template),
            );
        }
        sfset.metadata.annotations = Some(annotations);

        sfset
    }

    fn api(&self, ctx: &Context, ndb: &NdbCluster) -> Api<StatefulSet> {
        let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(ctx.client.clone(), &namespace)
    }

    /// Fetch the StatefulSet and verify it is controlled by this
    /// NdbCluster. An unowned StatefulSet with the expected name is
    /// reported as a warning event and fails the sync.
    async fn get_owned(&self, ctx: &Context, ndb: &NdbCluster) -> Result<Option<StatefulSet>> {
        let name = ndb.get_workload_name(self.node_type());
        match self.api(ctx, ndb).get_opt(&name).await? {
            None => Ok(None),
            Some(sfset) if is_owned_by(&sfset.metadata, ndb) => Ok(Some(sfset)),
            Some(_) => {
                let err = Error::ResourceExists(name);
                ctx.publish_warning_event(
                    ndb,
                    REASON_RESOURCE_EXISTS,
                    "Ensure",
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Ensure the StatefulSet exists, creating it from the stored config
    /// when absent. Returns the object and whether it already existed.
    async fn ensure(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        summary: &ConfigSummary,
    ) -> Result<(StatefulSet, bool)> {
        if let Some(existing) = self.get_owned(ctx, ndb).await? {
            return Ok((existing, true));
        }

        let sfset = self.new_workload(ndb, summary);
        info!(
            name = %ndb.get_workload_name(self.node_type()),
            "Creating StatefulSet"
        );
        let created = self
            .api(ctx, ndb)
            .create(&PostParams::default(), &sfset)
            .await?;
        Ok((created, false))
    }

    /// Patch the StatefulSet when the observed object differs from the one
    /// the stored config calls for. Returns the patched object, or None
    /// when nothing had drifted.
    async fn patch_if_drifted(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        summary: &ConfigSummary,
        observed: &StatefulSet,
    ) -> Result<Option<StatefulSet>> {
        let desired = self.new_workload(ndb, summary);
        if !workload_drifted(observed, &desired) {
            return Ok(None);
        }

        let name = ndb.get_workload_name(self.node_type());
        info!(name = %name, "Patching drifted StatefulSet");
        let patched = self
            .api(ctx, ndb)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&desired),
            )
            .await?;
        Ok(Some(patched))
    }

    /// Patch only the replica count.
    async fn patch_replicas(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        replicas: i32,
    ) -> Result<StatefulSet> {
        let name = ndb.get_workload_name(self.node_type());
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        Ok(self
            .api(ctx, ndb)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    /// Delete the StatefulSet.
    async fn delete_workload(&self, ctx: &Context, ndb: &NdbCluster) -> Result<()> {
        let name = ndb.get_workload_name(self.node_type());
        info!(name = %name, "Deleting StatefulSet");
        match self.api(ctx, ndb).delete(&name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Controller for the management server StatefulSet.
pub struct MgmdController;

#[async_trait]
impl WorkloadControl for MgmdController {
    fn node_type(&self) -> NdbNodeType {
        NdbNodeType::Mgmd
    }
}

/// Controller for the data node StatefulSet.
pub struct NdbdController;

#[async_trait]
impl WorkloadControl for NdbdController {
    fn node_type(&self) -> NdbNodeType {
        NdbNodeType::Ndbd
    }
}

/// Controller for the MySQL Server StatefulSet.
pub struct MysqldController;

#[async_trait]
impl WorkloadControl for MysqldController {
    fn node_type(&self) -> NdbNodeType {
        NdbNodeType::Mysqld
    }

    fn extra_annotations(&self, ndb: &NdbCluster) -> BTreeMap<String, String> {
        // Record the secret backing the root account so teardown can find
        // it even after the spec dropped the mysqld block.
        let (secret_name, _) = ndb.get_root_password_secret_name();
        let mut annotations = BTreeMap::new();
        annotations.insert(ROOT_PASSWORD_SECRET_ANNOTATION.to_string(), secret_name);
        annotations
    }
}

impl MysqldController {
    /// Handle a requested scale down of the MySQL Servers. Runs before any
    /// new config is applied to management and data nodes so the servers
    /// release their API sections before those sections may shrink.
    pub async fn handle_scale_down(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        summary: &ConfigSummary,
        mysqld_sfset: Option<&StatefulSet>,
    ) -> StepResult {
        let Some(sfset) = mysqld_sfset else {
            // Nothing to scale down
            return continue_processing();
        };

        if !rollout_complete(sfset) {
            // A previous update is still rolling out. Reconciliation
            // continues once it settles.
            return finish_processing();
        }

        let target = summary.num_of_mysql_servers;
        let current = sfset.status.as_ref().map_or(0, |s| s.replicas);
        if current <= target {
            // No scale down requested, or it has been processed already
            return continue_processing();
        }

        if target == 0 {
            self.teardown(ctx, ndb, sfset).await?;
            return finish_processing();
        }

        info!(from = current, to = target, "Scaling down MySQL Servers");
        self.patch_replicas(ctx, ndb, target).await?;
        finish_processing()
    }

    /// Delete the MySQL Servers along with the root user and, when the
    /// operator minted it, the root password Secret.
    async fn teardown(&self, ctx: &Context, ndb: &NdbCluster, sfset: &StatefulSet) -> Result<()> {
        if let Some(root_host) = sfset.annotations().get(ROOT_HOST_ANNOTATION) {
            if let Err(e) = mysqlclient::delete_root_user_if_exists(sfset, root_host).await {
                error!(error = %e, "Failed to delete root user");
                return Err(e.into());
            }
        }

        let (derived_name, custom) = ndb.get_root_password_secret_name();
        if !custom {
            let secret_name = sfset
                .annotations()
                .get(ROOT_PASSWORD_SECRET_ANNOTATION)
                .cloned()
                .unwrap_or(derived_name);
            self.delete_owned_secret(ctx, ndb, &secret_name).await?;
        }

        self.delete_workload(ctx, ndb).await
    }

    /// Delete the root password Secret if this NdbCluster controls it.
    async fn delete_owned_secret(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        secret_name: &str,
    ) -> Result<()> {
        let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
        let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

        let Some(secret) = secret_api.get_opt(secret_name).await? else {
            return Ok(());
        };
        if !is_owned_by(&secret.metadata, ndb) {
            return Ok(());
        }

        info!(secret = %secret_name, "Deleting generated root password secret");
        match secret_api.delete(secret_name, &Default::default()).await {
            Ok(_) => Ok(()),
            // A redundant delete caused by an outdated cache read
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconcile the MySQL Server StatefulSet against the stored config:
    /// create it (with its root password Secret) when needed, patch it when
    /// it drifted. Runs after the new config has been ensured in both
    /// management and data nodes.
    pub async fn reconcile_statefulset(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        summary: &ConfigSummary,
        mysqld_sfset: Option<&StatefulSet>,
    ) -> StepResult {
        let Some(observed) = mysqld_sfset else {
            if summary.num_of_mysql_servers == 0 {
                // in sync with expectation
                return continue_processing();
            }

            self.ensure_root_password_secret(ctx, ndb).await?;
            self.ensure(ctx, ndb, summary).await?;
            // Reconciliation continues once the pods come up.
            return finish_processing();
        };

        match self.patch_if_drifted(ctx, ndb, summary, observed).await? {
            Some(_) => finish_processing(),
            None => continue_processing(),
        }
    }

    async fn ensure_root_password_secret(&self, ctx: &Context, ndb: &NdbCluster) -> Result<()> {
        let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
        let (secret_name, custom) = ndb.get_root_password_secret_name();
        let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

        if secret_api.get_opt(&secret_name).await?.is_some() {
            return Ok(());
        }
        if custom {
            return Err(Error::Validation(format!(
                "root password secret {secret_name} does not exist"
            )));
        }

        info!(secret = %secret_name, "Generating root password secret");
        secret_api
            .create(&PostParams::default(), &new_root_password_secret(ndb))
            .await?;
        Ok(())
    }

    /// Create or update the root user to match the spec. The StatefulSet
    /// annotations record the applied host and spec generation.
    pub async fn reconcile_root_user(
        &self,
        ctx: &Context,
        ndb: &NdbCluster,
        mysqld_sfset: Option<&StatefulSet>,
    ) -> StepResult {
        let Some(sfset) = mysqld_sfset else {
            // Nothing to do as the MySQL Servers do not exist
            return continue_processing();
        };

        let annotations = sfset.annotations();
        let applied_generation: i64 = annotations
            .get(ROOT_USER_GENERATION_ANNOTATION)
            .and_then(|g| g.parse().ok())
            .unwrap_or(0);
        let current_generation = ndb.metadata.generation.unwrap_or(0);
        if applied_generation == current_generation {
            // The root user spec is up-to-date
            return continue_processing();
        }

        let new_root_host = ndb.get_mysql_server_root_host();
        match annotations.get(ROOT_HOST_ANNOTATION) {
            None => {
                // Root user doesn't exist yet - create it
                let (secret_name, _) = ndb.get_root_password_secret_name();
                let namespace = ndb.namespace().unwrap_or_else(|| "default".to_string());
                let password = ctx.extract_password(&namespace, &secret_name).await?;
                mysqlclient::create_root_user_if_not_exists(sfset, &new_root_host, &password)
                    .await?;
            }
            Some(existing) if existing != &new_root_host => {
                mysqlclient::update_root_user(sfset, existing, &new_root_host).await?;
            }
            Some(_) => {}
        }

        // Mark the changes as applied on the StatefulSet
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    ROOT_HOST_ANNOTATION: new_root_host,
                    ROOT_USER_GENERATION_ANNOTATION: current_generation.to_string(),
                }
            }
        });
        let name = ndb.get_workload_name(self.node_type());
        self.api(ctx, ndb)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        continue_processing()
    }
}
