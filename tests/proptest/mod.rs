// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for ndb-operator.
//!
//! Uses proptest to generate random cluster topologies and verify the
//! invariants the reconciler depends on: node-id assignment never
//! overlaps, a rollout pass never touches two members of one node group,
//! the config generation is strictly monotone, and the stored config text
//! always parses back into the summary that produced it.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use ndb_operator::controller::sync::rollout_candidates;
use ndb_operator::controller::validation::has_valid_spec;
use ndb_operator::crd::{
    ImageSpec, MysqldSpec, NdbCluster, NdbClusterSpec, API_START_NODE_ID, MAX_NUMBER_OF_NODES,
};
use ndb_operator::mgmapi::{ClusterStatus, NodeRole, NodeStatus};
use ndb_operator::ndbconfig::generator::assign_node_ids;
use ndb_operator::ndbconfig::{
    calculate_spec_hash, generate_config_text, generate_my_cnf, ConfigSummary,
};
use ndb_operator::resources::pdb::new_pod_disruption_budget;

/// Strategy for valid redundancy levels.
fn valid_redundancy() -> impl Strategy<Value = i32> {
    1..=4i32
}

/// Strategy for node group counts.
fn valid_node_groups() -> impl Strategy<Value = i32> {
    1..=8i32
}

/// Strategy for MySQL Server and free API slot counts.
fn valid_api_count() -> impl Strategy<Value = i32> {
    0..=10i32
}

/// Build an NdbCluster for the given topology.
fn cluster(redundancy: i32, node_groups: i32, mysqlds: i32, api_slots: i32) -> NdbCluster {
    NdbCluster {
        metadata: ObjectMeta {
            name: Some("prop-ndb".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("prop-uid".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: NdbClusterSpec {
            redundancy_level: redundancy,
            node_count: redundancy * node_groups,
            free_api_slots: api_slots,
            data_node_config: BTreeMap::new(),
            management_node_config: BTreeMap::new(),
            image: ImageSpec::default(),
            mysqld: (mysqlds > 0).then(|| MysqldSpec {
                node_count: mysqlds,
                root_host: "%".to_string(),
                ..Default::default()
            }),
        },
        status: None,
    }
}

/// Build the cluster status a healthy cluster of this shape would report.
fn cluster_status(redundancy: i32, node_groups: i32) -> ClusterStatus {
    let mut status = ClusterStatus::default();
    let mgmd_count = if redundancy == 1 { 1 } else { 2 };
    for node_id in 1..=mgmd_count {
        status.insert(NodeStatus {
            node_id,
            role: NodeRole::Mgm,
            node_group: -1,
            connected: true,
        });
    }
    let mut node_id = mgmd_count;
    for group in 0..node_groups {
        for _ in 0..redundancy {
            node_id += 1;
            status.insert(NodeStatus {
                node_id,
                role: NodeRole::Ndb,
                node_group: group,
                connected: true,
            });
        }
    }
    status
}

proptest! {
    /// Node-id ranges never overlap across roles, and the API block
    /// always starts at the reserved offset.
    #[test]
    fn test_node_id_ranges_never_overlap(
        redundancy in valid_redundancy(),
        node_groups in valid_node_groups(),
        mysqlds in valid_api_count(),
        api_slots in valid_api_count(),
    ) {
        let ndb = cluster(redundancy, node_groups, mysqlds, api_slots);
        let ids = assign_node_ids(&ndb);

        let all: Vec<i32> = ids
            .mgmd
            .iter()
            .chain(&ids.ndbd)
            .chain(&ids.mysqld)
            .chain(&ids.api)
            .copied()
            .collect();
        let unique: BTreeSet<i32> = all.iter().copied().collect();
        prop_assert_eq!(unique.len(), all.len(), "node ids overlap: {:?}", all);

        prop_assert_eq!(ids.mgmd.first(), Some(&1));
        if mysqlds > 0 {
            prop_assert_eq!(ids.mysqld.first(), Some(&API_START_NODE_ID));
        } else if api_slots > 0 {
            prop_assert_eq!(ids.api.first(), Some(&API_START_NODE_ID));
        }
    }

    /// A rollout pass never selects two members of the same node group,
    /// and the passes of one full rollout cover every data node exactly
    /// once.
    #[test]
    fn test_rollout_passes_respect_node_groups(
        redundancy in valid_redundancy(),
        node_groups in valid_node_groups(),
    ) {
        let status = cluster_status(redundancy, node_groups);
        let groups = status.nodes_grouped_by_nodegroup().unwrap();
        prop_assert_eq!(groups.len(), node_groups as usize);

        let mut covered: BTreeSet<i32> = BTreeSet::new();
        for pass in 0..redundancy as usize {
            let candidates = rollout_candidates(&groups, pass);
            // one member of every group per pass
            prop_assert_eq!(candidates.len(), node_groups as usize);
            for group in &groups {
                let picked = candidates.iter().filter(|id| group.contains(id)).count();
                prop_assert!(picked <= 1, "pass {} picked {} nodes of group {:?}", pass, picked, group);
            }
            for id in candidates {
                prop_assert!(covered.insert(id), "node {} selected twice", id);
            }
        }
        let data_nodes: usize = groups.iter().map(Vec::len).sum();
        prop_assert_eq!(covered.len(), data_nodes);
    }

    /// The config generation is strictly monotone over any chain of
    /// regenerations.
    #[test]
    fn test_config_generation_is_monotone(
        redundancy in valid_redundancy(),
        node_groups in valid_node_groups(),
        regenerations in 1..=5usize,
    ) {
        let ndb = cluster(redundancy, node_groups, 2, 1);

        let mut prev: Option<ConfigSummary> = None;
        let mut last_generation = 0u32;
        for _ in 0..regenerations {
            let text = generate_config_text(&ndb, prev.as_ref(), "default").unwrap();
            let summary = ConfigSummary::from_config_text(&text, None).unwrap();
            prop_assert_eq!(summary.config_generation, last_generation + 1);
            last_generation = summary.config_generation;
            prev = Some(summary);
        }
    }

    /// Round-trip law: parsing a rendered config yields exactly the
    /// summary the spec calls for, and re-rendering is byte-identical.
    #[test]
    fn test_config_round_trip(
        redundancy in valid_redundancy(),
        node_groups in valid_node_groups(),
        mysqlds in valid_api_count(),
        api_slots in valid_api_count(),
    ) {
        let ndb = cluster(redundancy, node_groups, mysqlds, api_slots);

        let text = generate_config_text(&ndb, None, "default").unwrap();
        let reparsed = ConfigSummary::from_config_text(&text, None).unwrap();
        let expected = ConfigSummary {
            config_generation: 1,
            resource_generation: 1,
            config_hash: calculate_spec_hash(&ndb).unwrap(),
            my_cnf_generation: 0,
            redundancy_level: redundancy,
            num_of_data_nodes: redundancy * node_groups,
            num_of_mysql_servers: mysqlds,
            num_of_free_api_slots: api_slots,
        };
        prop_assert_eq!(&reparsed, &expected);

        let again = generate_config_text(&ndb, None, "default").unwrap();
        prop_assert_eq!(text, again);
    }

    /// The data node disruption budget tolerates exactly one node per
    /// node group.
    #[test]
    fn test_pdb_allows_one_disruption_per_group(
        redundancy in valid_redundancy(),
        node_groups in valid_node_groups(),
    ) {
        let ndb = cluster(redundancy, node_groups, 0, 0);
        let pdb = new_pod_disruption_budget(&ndb);

        let min_available = match pdb.spec.unwrap().min_available.unwrap() {
            IntOrString::Int(v) => v,
            IntOrString::String(s) => panic!("unexpected string minAvailable {s:?}"),
        };
        prop_assert_eq!(ndb.spec.node_count - min_available, node_groups);
    }

    /// The my.cnf generation counts independently of the cluster config
    /// generation.
    #[test]
    fn test_my_cnf_generation_is_independent(
        redundancy in valid_redundancy(),
        node_groups in valid_node_groups(),
    ) {
        let mut ndb = cluster(redundancy, node_groups, 2, 0);
        ndb.spec.mysqld.as_mut().unwrap().my_cnf = Some("max_user_connections=42".to_string());

        let config = generate_config_text(&ndb, None, "default").unwrap();
        let my_cnf = generate_my_cnf(&ndb, None).unwrap();
        let summary = ConfigSummary::from_config_text(&config, Some(&my_cnf)).unwrap();

        // bump only my.cnf
        let next_cnf = generate_my_cnf(&ndb, Some(&summary)).unwrap();
        let next = ConfigSummary::from_config_text(&config, Some(&next_cnf)).unwrap();
        prop_assert_eq!(next.my_cnf_generation, summary.my_cnf_generation + 1);
        prop_assert_eq!(next.config_generation, summary.config_generation);
    }

    /// Specs whose data node count is not a multiple of the redundancy
    /// level never validate.
    #[test]
    fn test_unbalanced_node_counts_rejected(
        redundancy in 2..=4i32,
        node_count in 1..=32i32,
    ) {
        let mut ndb = cluster(redundancy, 1, 0, 0);
        ndb.spec.node_count = node_count;

        let result = has_valid_spec(&ndb);
        if node_count % redundancy == 0 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }

    /// The total node count is capped at the MySQL Cluster maximum.
    #[test]
    fn test_total_node_cap(
        redundancy in valid_redundancy(),
        // wide enough to land on both sides of the 145-node cap
        node_groups in 1..=48i32,
        mysqlds in valid_api_count(),
        api_slots in valid_api_count(),
    ) {
        let ndb = cluster(redundancy, node_groups, mysqlds, api_slots);
        let total = ndb.total_number_of_nodes();

        let result = has_valid_spec(&ndb);
        if total <= MAX_NUMBER_OF_NODES {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }
}
