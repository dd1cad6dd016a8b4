//! Rendering of the MySQL Cluster configuration from an NdbCluster spec.
//!
//! The generated `config.ini` is the authoritative description of the
//! cluster topology. Node ids are assigned deterministically: management
//! nodes first, data nodes next, and the API block (`[mysqld]` sections for
//! MySQL Servers followed by free `[api]` slots) from a fixed offset.

use kube::ResourceExt;
use tracing::warn;

use crate::crd::{NdbCluster, NdbNodeType, API_START_NODE_ID, NDB_PORT};
use crate::ndbconfig::parser::ConfigIni;
use crate::ndbconfig::summary::{calculate_spec_hash, ConfigSummary};
use crate::ndbconfig::ConfigError;

/// Directory backing the management and data node volumes.
pub const DATA_DIR: &str = "/var/lib/ndb";

/// Node ids assigned to each role, in ordinal order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdAssignment {
    pub mgmd: Vec<i32>,
    pub ndbd: Vec<i32>,
    pub mysqld: Vec<i32>,
    pub api: Vec<i32>,
}

/// Assign node ids for all roles of the given cluster. Management and data
/// nodes share the low id range; MySQL Server and free API sections start
/// at [`API_START_NODE_ID`].
pub fn assign_node_ids(ndb: &NdbCluster) -> NodeIdAssignment {
    fn take(next_id: &mut i32, count: i32) -> Vec<i32> {
        let ids = (*next_id..*next_id + count).collect();
        *next_id += count;
        ids
    }

    let mut next_id = 1;
    let mgmd = take(&mut next_id, ndb.get_management_node_count());
    let ndbd = take(&mut next_id, ndb.spec.node_count);

    next_id = API_START_NODE_ID;
    let mysqld = take(&mut next_id, ndb.get_mysql_server_node_count());
    let api = take(&mut next_id, ndb.spec.free_api_slots);

    NodeIdAssignment {
        mgmd,
        ndbd,
        mysqld,
        api,
    }
}

/// The DNS name of a MySQL Cluster node, derived from the pod name, the
/// governing service and the namespace suffix.
fn node_hostname(ndb: &NdbCluster, node_type: NdbNodeType, ordinal: usize, suffix: &str) -> String {
    format!(
        "{}-{}-{}.{}.{}",
        ndb.name_any(),
        node_type,
        ordinal,
        ndb.get_service_name(node_type),
        suffix
    )
}

/// Render the cluster `config.ini` text.
///
/// The config generation number is 1 for a fresh cluster and otherwise the
/// previous summary's generation plus one. Equivalence is not checked here;
/// callers gate regeneration by comparing the spec hash. Rendering the same
/// spec against the same previous summary is byte-stable.
pub fn generate_config_text(
    ndb: &NdbCluster,
    old_summary: Option<&ConfigSummary>,
    hostname_suffix: &str,
) -> Result<String, ConfigError> {
    let config_version = old_summary.map_or(1, |s| s.config_generation + 1);
    let config_hash = calculate_spec_hash(ndb)?;
    let generation = ndb.metadata.generation.unwrap_or(0);

    let mut ini = String::new();
    ini.push_str("# Auto generated config.ini - DO NOT EDIT\n");
    ini.push_str(&format!("# NdbClusterGeneration={generation}\n"));
    ini.push_str(&format!("# ConfigHash={config_hash}\n\n"));

    ini.push_str("[system]\n");
    ini.push_str(&format!("ConfigGenerationNumber={config_version}\n"));
    ini.push_str(&format!("Name={}\n\n", ndb.name_any()));

    if !ndb.spec.management_node_config.is_empty() {
        ini.push_str("[ndb_mgmd default]\n");
        for (key, value) in &ndb.spec.management_node_config {
            ini.push_str(&format!("{key}={value}\n"));
        }
        ini.push('\n');
    }

    ini.push_str("[ndbd default]\n");
    ini.push_str(&format!("NoOfReplicas={}\n", ndb.spec.redundancy_level));
    // Use a fixed ServerPort for all data nodes
    ini.push_str(&format!("ServerPort={NDB_PORT}\n"));
    for (key, value) in &ndb.spec.data_node_config {
        ini.push_str(&format!("{key}={value}\n"));
    }
    ini.push('\n');

    ini.push_str("[tcp default]\n");
    ini.push_str("AllowUnresolvedHostnames=1\n\n");

    let ids = assign_node_ids(ndb);

    for (ordinal, node_id) in ids.mgmd.iter().enumerate() {
        ini.push_str("[ndb_mgmd]\n");
        ini.push_str(&format!("NodeId={node_id}\n"));
        ini.push_str(&format!(
            "Hostname={}\n",
            node_hostname(ndb, NdbNodeType::Mgmd, ordinal, hostname_suffix)
        ));
        ini.push_str(&format!("DataDir={DATA_DIR}/data\n\n"));
    }

    for (ordinal, node_id) in ids.ndbd.iter().enumerate() {
        ini.push_str("[ndbd]\n");
        ini.push_str(&format!("NodeId={node_id}\n"));
        ini.push_str(&format!(
            "Hostname={}\n",
            node_hostname(ndb, NdbNodeType::Ndbd, ordinal, hostname_suffix)
        ));
        ini.push_str(&format!("DataDir={DATA_DIR}/data\n\n"));
    }

    ini.push_str("# MySQLD sections to be used exclusively by MySQL Servers\n");
    for (ordinal, node_id) in ids.mysqld.iter().enumerate() {
        ini.push_str("[mysqld]\n");
        ini.push_str(&format!("NodeId={node_id}\n"));
        ini.push_str(&format!(
            "Hostname={}\n\n",
            node_hostname(ndb, NdbNodeType::Mysqld, ordinal, hostname_suffix)
        ));
    }

    ini.push_str("# API sections to be used by generic NDBAPI applications\n");
    for node_id in &ids.api {
        ini.push_str("[api]\n");
        ini.push_str(&format!("NodeId={node_id}\n\n"));
    }

    Ok(ini)
}

/// Render the MySQL Server `my.cnf`, or None when the spec carries no
/// custom configuration. The embedded ConfigVersion counts independently of
/// the cluster config generation so SQL-only edits never restart NDB nodes.
pub fn generate_my_cnf(ndb: &NdbCluster, old_summary: Option<&ConfigSummary>) -> Option<String> {
    let cnf = ndb.get_my_cnf()?;
    let version = old_summary.map_or(1, |s| s.my_cnf_generation + 1);

    let mut out = String::new();
    out.push_str("# Auto generated my.cnf - DO NOT EDIT\n");
    out.push_str(&format!("# ConfigVersion={version}\n\n"));
    out.push_str(&normalized_my_cnf(cnf));
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

/// Normalize a user-supplied my.cnf: the `[mysqld]` section header is
/// optional and is prepended when missing.
pub fn normalized_my_cnf(cnf: &str) -> String {
    match ConfigIni::parse(cnf) {
        Err(ConfigError::LineWithoutSection(_)) => format!("[mysqld]\n{cnf}"),
        _ => cnf.to_string(),
    }
}

/// Deduce the namespace suffix used in generated hostnames.
///
/// When the Kubernetes cluster domain can be found the suffix has the form
/// `<namespace>.svc.<cluster-domain>`; otherwise the bare namespace is used.
/// The domain is deduced by looking up the CNAME of the well-known API
/// server service name.
pub async fn resolve_hostname_suffix(namespace: &str) -> String {
    use hickory_resolver::proto::rr::{RData, RecordType};
    use hickory_resolver::TokioAsyncResolver;

    const K8S_SERVICE: &str = "kubernetes.default.svc.";

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(err) => {
            warn!(error = %err, "System resolver unavailable, using partial subdomain in generated hostnames");
            return namespace.to_string();
        }
    };

    match resolver.lookup(K8S_SERVICE, RecordType::CNAME).await {
        Ok(lookup) => {
            if let Some(RData::CNAME(target)) = lookup.iter().next() {
                // The target has the form "kubernetes.default.svc.<cluster-domain>."
                let fqdn = target.0.to_utf8();
                if let Some(rest) = fqdn.strip_prefix("kubernetes.default") {
                    return format!("{}{}", namespace, rest.trim_end_matches('.'));
                }
            }
            warn!("Unexpected CNAME for {K8S_SERVICE}, using partial subdomain in generated hostnames");
            namespace.to_string()
        }
        Err(err) => {
            warn!(error = %err, "Cluster domain lookup failed, using partial subdomain in generated hostnames");
            namespace.to_string()
        }
    }
}
