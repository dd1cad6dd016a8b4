//! NdbCluster Custom Resource Definition.
//!
//! Defines the NdbCluster CRD for deploying and managing MySQL NDB Cluster
//! installations on Kubernetes. A single resource describes the full cluster
//! topology: management nodes, data nodes, MySQL Servers and free API slots.

use std::collections::BTreeMap;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum number of nodes a MySQL Cluster supports (all roles combined).
pub const MAX_NUMBER_OF_NODES: i32 = 145;

/// First node id handed out to the API section block ([mysqld]/[api]).
pub const API_START_NODE_ID: i32 = 129;

/// Port used by management and data nodes.
pub const NDB_PORT: i32 = 1186;

/// Port used by MySQL Servers.
pub const MYSQLD_PORT: i32 = 3306;

/// Condition type reported in the NdbCluster status.
pub const CONDITION_UP_TO_DATE: &str = "UpToDate";

/// UpToDate condition reasons.
pub const REASON_SYNC_SUCCESS: &str = "SyncSuccess";
pub const REASON_ISR: &str = "ISR";
pub const REASON_SPEC_UPDATE_IN_PROGRESS: &str = "SpecUpdateInProgress";
pub const REASON_ERROR: &str = "Error";

/// NdbCluster is a custom resource for running MySQL NDB Cluster.
///
/// Example:
/// ```yaml
/// apiVersion: ndboperator.mysql.com/v1
/// kind: NdbCluster
/// metadata:
///   name: example-ndb
/// spec:
///   redundancyLevel: 2
///   nodeCount: 2
///   mysqld:
///     nodeCount: 2
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ndboperator.mysql.com",
    version = "v1",
    kind = "NdbCluster",
    plural = "ndbclusters",
    shortname = "ndb",
    status = "NdbClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Replica", "type":"integer", "jsonPath":".spec.redundancyLevel"}"#,
    printcolumn = r#"{"name":"Management Nodes", "type":"string", "jsonPath":".status.readyManagementNodes"}"#,
    printcolumn = r#"{"name":"Data Nodes", "type":"string", "jsonPath":".status.readyDataNodes"}"#,
    printcolumn = r#"{"name":"MySQL Servers", "type":"string", "jsonPath":".status.readyMySQLServers"}"#,
    printcolumn = r#"{"name":"Up-To-Date", "type":"string", "jsonPath":".status.conditions[0].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NdbClusterSpec {
    /// Number of copies of all data stored by the data nodes, i.e. the
    /// number of data nodes per node group. Cannot be changed once the
    /// cluster has been started.
    #[serde(default = "default_redundancy_level")]
    pub redundancy_level: i32,

    /// Total number of data nodes. Must be a positive multiple of the
    /// redundancy level.
    pub node_count: i32,

    /// Number of extra API sections declared in the cluster configuration,
    /// in addition to the sections reserved for MySQL Servers.
    #[serde(default)]
    pub free_api_slots: i32,

    /// Additional configuration applied to the `[ndbd default]` section.
    #[serde(default)]
    pub data_node_config: BTreeMap<String, String>,

    /// Additional configuration applied to the `[ndb_mgmd default]` section.
    #[serde(default)]
    pub management_node_config: BTreeMap<String, String>,

    /// MySQL Cluster container image configuration.
    #[serde(default)]
    pub image: ImageSpec,

    /// Configuration of the MySQL Servers that connect to the cluster.
    /// When absent, no MySQL Servers are run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysqld: Option<MysqldSpec>,
}

fn default_redundancy_level() -> i32 {
    2
}

/// Container image specification.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Container image repository (default: mysql/mysql-cluster).
    #[serde(default = "default_image_repository")]
    pub repository: String,

    /// Image tag (default: 8.4.5).
    #[serde(default = "default_image_tag")]
    pub tag: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub pull_policy: String,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            repository: default_image_repository(),
            tag: default_image_tag(),
            pull_policy: default_image_pull_policy(),
        }
    }
}

fn default_image_repository() -> String {
    "mysql/mysql-cluster".to_string()
}

fn default_image_tag() -> String {
    "8.4.5".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// MySQL Server configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqldSpec {
    /// Number of MySQL Servers to run.
    #[serde(default)]
    pub node_count: i32,

    /// Host from which the root user can connect (default: %).
    #[serde(default = "default_root_host")]
    pub root_host: String,

    /// Name of a Secret holding the root password under the key
    /// `password`. When absent the operator generates one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password_secret_name: Option<String>,

    /// Additional MySQL Server configuration, either a bare list of
    /// options or a full `[mysqld]` section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub my_cnf: Option<String>,
}

fn default_root_host() -> String {
    "%".to_string()
}

/// Status of an NdbCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NdbClusterStatus {
    /// The spec generation most recently applied in full to the
    /// MySQL Cluster.
    #[serde(default)]
    pub processed_generation: i64,

    /// Management node readiness in "Ready:x/y" format.
    #[serde(default)]
    pub ready_management_nodes: String,

    /// Data node readiness in "Ready:x/y" format.
    #[serde(default)]
    pub ready_data_nodes: String,

    /// MySQL Server readiness in "Ready:x/y" format.
    #[serde(rename = "readyMySQLServers", default)]
    pub ready_mysql_servers: String,

    /// Name of the root password Secret, set only when the operator
    /// generated it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_root_password_secret_name: Option<String>,

    /// Conditions describing the state of the MySQL Cluster.
    #[serde(default)]
    pub conditions: Vec<NdbClusterCondition>,
}

/// Condition describing one aspect of the cluster state.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NdbClusterCondition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
}

impl NdbClusterCondition {
    /// Create an UpToDate condition.
    pub fn up_to_date(status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: CONDITION_UP_TO_DATE.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }
}

/// The node roles making up a MySQL Cluster, as used in resource names,
/// labels and the generated configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NdbNodeType {
    /// Management server (ndb_mgmd).
    Mgmd,
    /// Data node (ndbmtd).
    Ndbd,
    /// MySQL Server (mysqld).
    Mysqld,
}

impl NdbNodeType {
    /// Short name used as the resource name suffix and selector value.
    pub fn as_str(&self) -> &'static str {
        match self {
            NdbNodeType::Mgmd => "mgmd",
            NdbNodeType::Ndbd => "ndbd",
            NdbNodeType::Mysqld => "mysqld",
        }
    }
}

impl std::fmt::Display for NdbNodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NdbCluster {
    /// Number of management nodes run for this cluster. A single
    /// management node is sufficient when there is only one replica.
    pub fn get_management_node_count(&self) -> i32 {
        if self.spec.redundancy_level == 1 { 1 } else { 2 }
    }

    /// Number of MySQL Servers requested by the spec.
    pub fn get_mysql_server_node_count(&self) -> i32 {
        self.spec.mysqld.as_ref().map_or(0, |m| m.node_count)
    }

    /// Host from which the MySQL root user may connect.
    pub fn get_mysql_server_root_host(&self) -> String {
        self.spec
            .mysqld
            .as_ref()
            .map_or_else(default_root_host, |m| m.root_host.clone())
    }

    /// The my.cnf content passed in the spec, if any.
    pub fn get_my_cnf(&self) -> Option<&str> {
        self.spec
            .mysqld
            .as_ref()
            .and_then(|m| m.my_cnf.as_deref())
            .filter(|cnf| !cnf.trim().is_empty())
    }

    /// Number of node groups formed by the data nodes.
    pub fn number_of_node_groups(&self) -> i32 {
        self.spec.node_count / self.spec.redundancy_level
    }

    /// Total number of nodes declared in the cluster configuration.
    pub fn total_number_of_nodes(&self) -> i32 {
        self.get_management_node_count()
            + self.spec.node_count
            + self.get_mysql_server_node_count()
            + self.spec.free_api_slots
    }

    /// Full container image reference.
    pub fn image(&self) -> String {
        format!("{}:{}", self.spec.image.repository, self.spec.image.tag)
    }

    /// Name of the governing (headless) service for the given node type.
    /// The `-ext` suffixed LoadBalancer services derive from this name.
    pub fn get_service_name(&self, node_type: NdbNodeType) -> String {
        format!("{}-{}", self.name_any(), node_type)
    }

    /// Name of the StatefulSet running the given node type.
    pub fn get_workload_name(&self, node_type: NdbNodeType) -> String {
        format!("{}-{}", self.name_any(), node_type)
    }

    /// Name of the ConfigMap holding the generated cluster configuration.
    pub fn get_config_map_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    /// Name of the PodDisruptionBudget protecting the data nodes.
    pub fn get_pod_disruption_budget_name(&self) -> String {
        format!("{}-pdb-{}", self.name_any(), NdbNodeType::Ndbd)
    }

    /// Name of the root password Secret and whether it was supplied by the
    /// user. A user-supplied Secret is never deleted by the operator.
    pub fn get_root_password_secret_name(&self) -> (String, bool) {
        if let Some(name) = self
            .spec
            .mysqld
            .as_ref()
            .and_then(|m| m.root_password_secret_name.clone())
        {
            (name, true)
        } else {
            (format!("{}-mysqld-root-password", self.name_any()), false)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_cluster(redundancy: i32, data_nodes: i32, mysqlds: i32) -> NdbCluster {
        NdbCluster {
            metadata: ObjectMeta {
                name: Some("example-ndb".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: NdbClusterSpec {
                redundancy_level: redundancy,
                node_count: data_nodes,
                free_api_slots: 0,
                data_node_config: BTreeMap::new(),
                management_node_config: BTreeMap::new(),
                image: ImageSpec::default(),
                mysqld: (mysqlds > 0).then(|| MysqldSpec {
                    node_count: mysqlds,
                    root_host: default_root_host(),
                    ..Default::default()
                }),
            },
            status: None,
        }
    }

    #[test]
    fn test_management_node_count() {
        assert_eq!(test_cluster(2, 2, 0).get_management_node_count(), 2);
        assert_eq!(test_cluster(3, 3, 0).get_management_node_count(), 2);
        assert_eq!(test_cluster(1, 1, 0).get_management_node_count(), 1);
    }

    #[test]
    fn test_node_groups_and_totals() {
        let nc = test_cluster(2, 4, 2);
        assert_eq!(nc.number_of_node_groups(), 2);
        // 2 mgmd + 4 ndbd + 2 mysqld
        assert_eq!(nc.total_number_of_nodes(), 8);
    }

    #[test]
    fn test_names() {
        let nc = test_cluster(2, 2, 2);
        assert_eq!(nc.get_service_name(NdbNodeType::Mgmd), "example-ndb-mgmd");
        assert_eq!(nc.get_workload_name(NdbNodeType::Ndbd), "example-ndb-ndbd");
        assert_eq!(nc.get_config_map_name(), "example-ndb-config");
        assert_eq!(nc.get_pod_disruption_budget_name(), "example-ndb-pdb-ndbd");
    }

    #[test]
    fn test_root_password_secret_name() {
        let nc = test_cluster(2, 2, 2);
        let (name, custom) = nc.get_root_password_secret_name();
        assert_eq!(name, "example-ndb-mysqld-root-password");
        assert!(!custom);

        let mut nc = test_cluster(2, 2, 2);
        nc.spec.mysqld.as_mut().unwrap().root_password_secret_name =
            Some("my-secret".to_string());
        let (name, custom) = nc.get_root_password_secret_name();
        assert_eq!(name, "my-secret");
        assert!(custom);
    }

    #[test]
    fn test_my_cnf_empty_is_none() {
        let mut nc = test_cluster(2, 2, 2);
        nc.spec.mysqld.as_mut().unwrap().my_cnf = Some("  \n".to_string());
        assert!(nc.get_my_cnf().is_none());

        nc.spec.mysqld.as_mut().unwrap().my_cnf = Some("max_user_connections=42".to_string());
        assert_eq!(nc.get_my_cnf(), Some("max_user_connections=42"));
    }

    #[test]
    fn test_spec_serialization() {
        let nc = test_cluster(2, 4, 2);
        let json = serde_json::to_string(&nc.spec).expect("serialization should succeed");
        assert!(json.contains("\"redundancyLevel\":2"));
        assert!(json.contains("\"nodeCount\":4"));
        let parsed: NdbClusterSpec =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(parsed.node_count, 4);
        assert_eq!(parsed.mysqld.unwrap().node_count, 2);
    }

    #[test]
    fn test_condition_up_to_date() {
        let cond = NdbClusterCondition::up_to_date(true, REASON_SYNC_SUCCESS, "synced");
        assert_eq!(cond.r#type, CONDITION_UP_TO_DATE);
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason, REASON_SYNC_SUCCESS);

        let cond = NdbClusterCondition::up_to_date(false, REASON_ISR, "starting");
        assert_eq!(cond.status, "False");
    }
}
