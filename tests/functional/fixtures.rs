//! Shared fixtures for the functional tests.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use ndb_operator::crd::{ImageSpec, MysqldSpec, NdbCluster, NdbClusterSpec};
use ndb_operator::ndbconfig::{generate_config_text, generate_my_cnf, ConfigSummary};

/// An NdbCluster resource of the given topology at the given spec
/// generation.
pub fn cluster(
    generation: i64,
    redundancy: i32,
    data_nodes: i32,
    mysqlds: i32,
    api_slots: i32,
) -> NdbCluster {
    NdbCluster {
        metadata: ObjectMeta {
            name: Some("example-ndb".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("test-uid".to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        spec: NdbClusterSpec {
            redundancy_level: redundancy,
            node_count: data_nodes,
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

/// Render the cluster config the way the operator stores it and digest it
/// back, as every tick does against the ConfigMap.
pub fn stored_summary(ndb: &NdbCluster, prev: Option<&ConfigSummary>) -> (String, ConfigSummary) {
    let config = generate_config_text(ndb, prev, "default").unwrap();
    let my_cnf = generate_my_cnf(ndb, prev);
    let summary = ConfigSummary::from_config_text(&config, my_cnf.as_deref()).unwrap();
    (config, summary)
}

/// A StatefulSet whose rollout has settled at the given replica count.
pub fn settled_sfset(replicas: i32) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            observed_generation: Some(1),
            replicas,
            updated_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}
