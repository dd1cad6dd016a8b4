//! End-to-end sync scenarios, exercised against the operator's pure core.
//!
//! Each test mirrors one lifecycle a real NdbCluster goes through: cold
//! start, MySQL Server scale down and removal, my.cnf-only edits, root
//! host changes and a spec update landing in the middle of a rollout.

use crate::fixtures::{cluster, settled_sfset, stored_summary};

use ndb_operator::controller::status::calculate_status;
use ndb_operator::controller::sync::rollout_candidates;
use ndb_operator::controller::validation::is_valid_spec_update;
use ndb_operator::controller::workloads::{
    rollout_complete, workload_drifted, MgmdController, MysqldController, NdbdController,
    WorkloadControl,
};
use ndb_operator::crd::{NdbNodeType, REASON_ISR, REASON_SPEC_UPDATE_IN_PROGRESS, REASON_SYNC_SUCCESS};
use ndb_operator::mgmapi::{ClusterStatus, NodeRole, NodeStatus};
use ndb_operator::ndbconfig::{calculate_spec_hash, generate_my_cnf, ConfigSummary};
use ndb_operator::resources::statefulset::{desired_replicas, pod_template_hash};

// ============================================================================
// Scenario: cold start
// ============================================================================

/// A fresh `{dn=2, rl=2, sql=2, api=2}` cluster: the first stored config
/// carries generation 1 with the reserved node-id layout, the condition
/// starts at ISR, and a verified sync advances processedGeneration to 1
/// with SyncSuccess.
#[test]
fn test_cold_start() {
    let ndb = cluster(1, 2, 2, 2, 2);
    let (config, summary) = stored_summary(&ndb, None);

    assert!(config.contains("ConfigGenerationNumber=1"));
    // mgmd 1-2, ndbd 3-4, mysqld 129-130, api 131-132
    for node_id in [1, 2, 3, 4, 129, 130, 131, 132] {
        assert!(config.contains(&format!("NodeId={node_id}")), "missing node id {node_id}");
    }
    assert_eq!(summary.config_generation, 1);
    assert_eq!(summary.num_of_data_nodes, 2);
    assert_eq!(summary.num_of_mysql_servers, 2);
    assert_eq!(summary.num_of_free_api_slots, 2);

    // resources just created, pods not ready yet
    let status = calculate_status(&ndb, None, None, None, false, &[]);
    assert_eq!(status.conditions[0].reason, REASON_ISR);
    assert_eq!(status.processed_generation, 0);
    assert_eq!(status.ready_data_nodes, "Ready:0/2");

    // cluster healthy, config verified on every node
    let mgmd = settled_sfset(2);
    let ndbd = settled_sfset(2);
    let mysqld = settled_sfset(2);
    let status = calculate_status(&ndb, Some(&mgmd), Some(&ndbd), Some(&mysqld), true, &[]);
    assert_eq!(status.conditions[0].status, "True");
    assert_eq!(status.conditions[0].reason, REASON_SYNC_SUCCESS);
    assert_eq!(status.processed_generation, 1);
    assert_eq!(status.ready_mysql_servers, "Ready:2/2");
}

// ============================================================================
// Scenario: MySQL Server scale down 4 -> 2
// ============================================================================

/// Scaling the MySQL Servers from 4 to 2 regenerates the stored config at
/// the next generation with two fewer `[mysqld]` sections; the workload
/// target follows the stored config, not the live spec.
#[test]
fn test_scale_mysql_servers_down() {
    let before = cluster(1, 2, 2, 4, 2);
    let (_, summary) = stored_summary(&before, None);
    assert_eq!(desired_replicas(&summary, NdbNodeType::Mysqld), 4);

    // user scales down; the spec slice hash diverges from the stored one
    let after = cluster(2, 2, 2, 2, 2);
    assert_ne!(calculate_spec_hash(&after).unwrap(), summary.config_hash);

    // a settled workload at the old size is a pending scale down
    let observed = settled_sfset(4);
    assert!(rollout_complete(&observed));

    // the regenerated config bumps the generation and drops two sections
    let (config, next) = stored_summary(&after, Some(&summary));
    assert_eq!(next.config_generation, 2);
    assert_eq!(next.num_of_mysql_servers, 2);
    assert!(config.contains("NodeId=129"));
    assert!(config.contains("NodeId=130"));
    assert_eq!(desired_replicas(&next, NdbNodeType::Mysqld), 2);

    // and the mysqld workload built from the new config differs
    let old_workload = MysqldController.new_workload(&after, &summary);
    let new_workload = MysqldController.new_workload(&after, &next);
    assert!(workload_drifted(&old_workload, &new_workload));
}

// ============================================================================
// Scenario: removing all MySQL Servers
// ============================================================================

/// Dropping the mysqld block entirely ends with a config that declares no
/// `[mysqld]` sections at all and a workload target of zero.
#[test]
fn test_removing_all_mysql_servers() {
    let before = cluster(1, 2, 2, 2, 2);
    let (_, summary) = stored_summary(&before, None);

    let after = cluster(2, 2, 2, 0, 2);
    assert_ne!(calculate_spec_hash(&after).unwrap(), summary.config_hash);

    let (config, next) = stored_summary(&after, Some(&summary));
    assert_eq!(next.config_generation, 2);
    assert_eq!(next.num_of_mysql_servers, 0);
    assert_eq!(desired_replicas(&next, NdbNodeType::Mysqld), 0);
    assert!(!config.contains("# MySQLD sections to be used exclusively by MySQL Servers\n[mysqld]"));
    // the free API slots move down into the reserved range
    assert!(config.contains("[api]\nNodeId=129"));
}

// ============================================================================
// Scenario: my.cnf-only change
// ============================================================================

/// Editing only my.cnf bumps the my.cnf generation and re-templates the
/// MySQL Server pods; the cluster config generation is untouched and the
/// NDB node templates do not move.
#[test]
fn test_my_cnf_only_change() {
    let mut ndb = cluster(1, 2, 2, 2, 0);
    ndb.spec.mysqld.as_mut().unwrap().my_cnf = Some("max_user_connections=42".to_string());
    let (_, summary) = stored_summary(&ndb, None);
    assert_eq!(summary.my_cnf_generation, 1);

    let mut updated = cluster(2, 2, 2, 2, 0);
    updated.spec.mysqld.as_mut().unwrap().my_cnf =
        Some("max_user_connections=84".to_string());

    // the cluster config is unaffected by the edit
    assert_eq!(calculate_spec_hash(&updated).unwrap(), summary.config_hash);

    let next_cnf = generate_my_cnf(&updated, Some(&summary)).unwrap();
    assert!(next_cnf.contains("# ConfigVersion=2"));

    let next = ConfigSummary {
        my_cnf_generation: 2,
        ..summary.clone()
    };
    assert_eq!(next.config_generation, summary.config_generation);

    // only the mysqld pod template changes
    let mysqld_before = MysqldController.new_workload(&ndb, &summary);
    let mysqld_after = MysqldController.new_workload(&updated, &next);
    assert!(workload_drifted(&mysqld_before, &mysqld_after));

    let mgmd_before = MgmdController.new_workload(&ndb, &summary);
    let mgmd_after = MgmdController.new_workload(&updated, &next);
    assert!(!workload_drifted(&mgmd_before, &mgmd_after));

    let ndbd_before = NdbdController.new_workload(&ndb, &summary);
    let ndbd_after = NdbdController.new_workload(&updated, &next);
    assert!(!workload_drifted(&ndbd_before, &ndbd_after));
}

// ============================================================================
// Scenario: root host change
// ============================================================================

/// Changing `rootHost` is applied through SQL, not through the workloads:
/// no config diff, no pod template change, and the update validates.
#[test]
fn test_root_host_change_touches_nothing_else() {
    let ndb = cluster(1, 2, 2, 2, 0);
    let (_, summary) = stored_summary(&ndb, None);

    let mut updated = cluster(2, 2, 2, 2, 0);
    updated.spec.mysqld.as_mut().unwrap().root_host = "10.0.0.%".to_string();

    assert!(is_valid_spec_update(&updated, &summary).is_ok());
    assert_eq!(calculate_spec_hash(&updated).unwrap(), summary.config_hash);

    let template_before = MysqldController
        .new_workload(&ndb, &summary)
        .spec
        .unwrap()
        .template;
    let template_after = MysqldController
        .new_workload(&updated, &summary)
        .spec
        .unwrap()
        .template;
    assert_eq!(
        pod_template_hash(&template_before),
        pod_template_hash(&template_after)
    );
}

// ============================================================================
// Scenario: spec update in the middle of a rollout
// ============================================================================

/// While generation N is still propagating to the data nodes, a newer
/// spec generation must wait: the rollout keeps following the stored
/// config, the stop sets never break a node group, and only a verified
/// sync advances processedGeneration.
#[test]
fn test_spec_update_mid_rollout() {
    // stored config at generation 2 (one change already applied)
    let ndb = cluster(2, 2, 4, 2, 0);
    let (_, gen1) = stored_summary(&ndb, None);
    let (_, gen2) = stored_summary(&ndb, Some(&gen1));
    assert_eq!(gen2.config_generation, 2);

    // the cluster reports two node groups of two data nodes
    let mut cluster_state = ClusterStatus::default();
    for (node_id, group) in [(3, 0), (4, 0), (5, 1), (6, 1)] {
        cluster_state.insert(NodeStatus {
            node_id,
            role: NodeRole::Ndb,
            node_group: group,
            connected: true,
        });
    }
    let groups = cluster_state.nodes_grouped_by_nodegroup().unwrap();

    // data nodes still run generation 1; each pass stops at most one
    // node per group until every node reports generation 2
    let running_generation = |_node_id: i32| 1u32;
    for pass in 0..2 {
        let outdated: Vec<i32> = rollout_candidates(&groups, pass)
            .into_iter()
            .filter(|&id| running_generation(id) != gen2.config_generation)
            .collect();
        assert_eq!(outdated.len(), 2);
        for group in &groups {
            assert_eq!(outdated.iter().filter(|id| group.contains(id)).count(), 1);
        }
    }

    // meanwhile the user submits generation 3; the diff against the
    // stored config only lands after the rollout, bumping to 3
    let mut newer = cluster(3, 2, 4, 2, 0);
    newer
        .spec
        .data_node_config
        .insert("MaxNoOfTables".to_string(), "1024".to_string());
    assert!(is_valid_spec_update(&newer, &gen2).is_ok());
    assert_ne!(calculate_spec_hash(&newer).unwrap(), gen2.config_hash);

    let (_, gen3) = stored_summary(&newer, Some(&gen2));
    assert_eq!(gen3.config_generation, 3);

    // status during the ongoing rollout keeps the old processed
    // generation; the verified sync moves it to 3 atomically
    let mut mid_rollout = newer.clone();
    mid_rollout.status = Some(calculate_status(
        &cluster(2, 2, 4, 2, 0),
        None,
        None,
        None,
        true,
        &[],
    ));
    let in_progress = calculate_status(&mid_rollout, None, None, None, false, &[]);
    assert_eq!(in_progress.conditions[0].reason, REASON_SPEC_UPDATE_IN_PROGRESS);
    assert_eq!(in_progress.processed_generation, 2);

    let verified = calculate_status(&mid_rollout, None, None, None, true, &[]);
    assert_eq!(verified.conditions[0].reason, REASON_SYNC_SUCCESS);
    assert_eq!(verified.processed_generation, 3);
}
