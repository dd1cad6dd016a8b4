//! Common resource generation utilities.
//!
//! Provides functions for creating standard Kubernetes resource metadata
//! including labels, annotations, and owner references.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{NdbCluster, NdbNodeType};

/// API group of the NdbCluster CRD, also used as the annotation prefix.
pub const GROUP: &str = "ndboperator.mysql.com";

/// StatefulSet annotation holding the hash of the last applied pod template.
pub const LAST_APPLIED_CONFIG_GENERATION: &str =
    "ndboperator.mysql.com/last-applied-config-generation";

/// MySQL Server StatefulSet annotation holding the root user's current host.
pub const ROOT_HOST_ANNOTATION: &str = "ndboperator.mysql.com/root-host";

/// MySQL Server StatefulSet annotation holding the NdbCluster generation
/// whose spec has been applied to the root user.
pub const ROOT_USER_GENERATION_ANNOTATION: &str = "ndboperator.mysql.com/root-user-generation";

/// MySQL Server StatefulSet annotation holding the root password Secret name.
pub const ROOT_PASSWORD_SECRET_ANNOTATION: &str = "ndboperator.mysql.com/root-password-secret";

/// Pod template annotation carrying the my.cnf generation, so MySQL Server
/// pods roll when the custom config changes.
pub const MY_CNF_VERSION_ANNOTATION: &str = "ndboperator.mysql.com/my-cnf-version";

/// Standard labels applied to all managed resources, following the
/// Kubernetes recommended labeling conventions.
pub fn standard_labels(ndb: &NdbCluster) -> BTreeMap<String, String> {
    let name = ndb.name_any();
    let mut labels = BTreeMap::new();

    labels.insert("app.kubernetes.io/name".to_string(), name.clone());
    labels.insert("app.kubernetes.io/instance".to_string(), name);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "ndb-operator".to_string(),
    );
    labels
}

/// Labels selecting the pods of one node type. Also applied to the pod
/// templates, so they must stay stable across operator versions.
pub fn pod_selector_labels(ndb: &NdbCluster, node_type: NdbNodeType) -> BTreeMap<String, String> {
    let name = ndb.name_any();
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), name.clone());
    labels.insert("app.kubernetes.io/instance".to_string(), name);
    labels.insert(
        format!("{GROUP}/node-type"),
        node_type.as_str().to_string(),
    );
    labels
}

/// Labels selecting every pod owned by the NdbCluster, regardless of role.
pub fn all_pods_selector(ndb: &NdbCluster) -> String {
    format!(
        "app.kubernetes.io/name={},app.kubernetes.io/instance={}",
        ndb.name_any(),
        ndb.name_any()
    )
}

/// Create the controller owner reference for an NdbCluster, so all created
/// resources are garbage collected when it is deleted.
pub fn owner_reference(ndb: &NdbCluster) -> OwnerReference {
    OwnerReference {
        api_version: format!("{GROUP}/v1"),
        kind: "NdbCluster".to_string(),
        name: ndb.name_any(),
        uid: ndb.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// True when the given metadata names this NdbCluster as its controller.
pub fn is_owned_by(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, ndb: &NdbCluster) -> bool {
    let uid = ndb.uid().unwrap_or_default();
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|or| or.controller == Some(true) && or.uid == uid)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crd::{ImageSpec, NdbClusterSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_cluster() -> NdbCluster {
        NdbCluster {
            metadata: ObjectMeta {
                name: Some("example-ndb".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: NdbClusterSpec {
                redundancy_level: 2,
                node_count: 2,
                free_api_slots: 0,
                data_node_config: BTreeMap::new(),
                management_node_config: BTreeMap::new(),
                image: ImageSpec::default(),
                mysqld: None,
            },
            status: None,
        }
    }

    #[test]
    fn test_standard_labels() {
        let labels = standard_labels(&test_cluster());
        assert_eq!(
            labels.get("app.kubernetes.io/name"),
            Some(&"example-ndb".to_string())
        );
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&"ndb-operator".to_string())
        );
    }

    #[test]
    fn test_pod_selector_labels() {
        let labels = pod_selector_labels(&test_cluster(), NdbNodeType::Ndbd);
        assert_eq!(
            labels.get("ndboperator.mysql.com/node-type"),
            Some(&"ndbd".to_string())
        );
    }

    #[test]
    fn test_owner_reference() {
        let owner_ref = owner_reference(&test_cluster());
        assert_eq!(owner_ref.kind, "NdbCluster");
        assert_eq!(owner_ref.api_version, "ndboperator.mysql.com/v1");
        assert_eq!(owner_ref.controller, Some(true));
    }

    #[test]
    fn test_is_owned_by() {
        let ndb = test_cluster();
        let mut meta = ObjectMeta {
            owner_references: Some(vec![owner_reference(&ndb)]),
            ..Default::default()
        };
        assert!(is_owned_by(&meta, &ndb));

        meta.owner_references = Some(vec![OwnerReference {
            uid: "other-uid".to_string(),
            ..owner_reference(&ndb)
        }]);
        assert!(!is_owned_by(&meta, &ndb));
    }
}
