//! PodDisruptionBudget generation for the data nodes.
//!
//! NDB keeps all data available as long as every node group retains at
//! least one live member. The budget allows exactly one voluntary
//! disruption per node group.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{NdbCluster, NdbNodeType};
use crate::resources::common::{owner_reference, pod_selector_labels, standard_labels};

/// Generate the PodDisruptionBudget for the data nodes.
///
/// `minAvailable = nodeCount - nodeGroups`: with `redundancyLevel` members
/// per group, this tolerates at most one disrupted node per group.
pub fn new_pod_disruption_budget(ndb: &NdbCluster) -> PodDisruptionBudget {
    let min_available = ndb.spec.node_count - ndb.number_of_node_groups();

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(ndb.get_pod_disruption_budget_name()),
            namespace: ndb.namespace(),
            labels: Some(standard_labels(ndb)),
            owner_references: Some(vec![owner_reference(ndb)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(pod_selector_labels(ndb, NdbNodeType::Ndbd)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crd::{ImageSpec, NdbClusterSpec};
    use std::collections::BTreeMap;

    fn test_cluster(redundancy: i32, data_nodes: i32) -> NdbCluster {
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
                mysqld: None,
            },
            status: None,
        }
    }

    #[test]
    fn test_min_available_allows_one_per_group() {
        // 4 data nodes in 2 groups of 2: 2 may be down, one per group
        let pdb = new_pod_disruption_budget(&test_cluster(2, 4));
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(2)));

        // 6 data nodes in 2 groups of 3
        let pdb = new_pod_disruption_budget(&test_cluster(3, 6));
        assert_eq!(
            pdb.spec.unwrap().min_available,
            Some(IntOrString::Int(4))
        );
    }

    #[test]
    fn test_pdb_selects_data_nodes() {
        let pdb = new_pod_disruption_budget(&test_cluster(2, 2));
        assert_eq!(pdb.metadata.name, Some("example-ndb-pdb-ndbd".to_string()));
        let labels = pdb
            .spec
            .unwrap()
            .selector
            .unwrap()
            .match_labels
            .unwrap();
        assert_eq!(
            labels.get("ndboperator.mysql.com/node-type"),
            Some(&"ndbd".to_string())
        );
    }
}
