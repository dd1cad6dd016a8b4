//! StatefulSet generation for the MySQL Cluster node types.
//!
//! All three workloads (management, data, MySQL Server) are StatefulSets
//! built from the *stored* config summary rather than the live spec, so a
//! partially rolled out config change is never mixed with a newer one.
//!
//! Management and data nodes use the OnDelete update strategy: their
//! restarts are driven through the management protocol, not by the
//! StatefulSet controller.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    PodSpec, PodTemplateSpec, Probe, SecretKeySelector, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{NdbCluster, NdbNodeType, MYSQLD_PORT, NDB_PORT};
use crate::ndbconfig::generator::DATA_DIR;
use crate::ndbconfig::ConfigSummary;
use crate::resources::common::{
    owner_reference, pod_selector_labels, MY_CNF_VERSION_ANNOTATION,
};
use crate::resources::configmap::{CONFIG_INI_KEY, MY_CNF_KEY};
use crate::resources::secret::ROOT_PASSWORD_KEY;

/// Termination grace period allowing a clean node shutdown.
const TERMINATION_GRACE_PERIOD: i64 = 60;

/// Desired replica count of a node type, as recorded in the stored config.
pub fn desired_replicas(summary: &ConfigSummary, node_type: NdbNodeType) -> i32 {
    match node_type {
        NdbNodeType::Mgmd => {
            if summary.redundancy_level == 1 {
                1
            } else {
                2
            }
        }
        NdbNodeType::Ndbd => summary.num_of_data_nodes,
        NdbNodeType::Mysqld => summary.num_of_mysql_servers,
    }
}

/// Generate the StatefulSet for the given node type.
pub fn new_statefulset(
    ndb: &NdbCluster,
    summary: &ConfigSummary,
    node_type: NdbNodeType,
) -> StatefulSet {
    let labels = pod_selector_labels(ndb, node_type);
    let template = pod_template(ndb, summary, node_type, &labels);

    // Management and data node restarts are requested through the
    // management server; keep the StatefulSet controller out of the way.
    let update_strategy = match node_type {
        NdbNodeType::Mgmd | NdbNodeType::Ndbd => Some(StatefulSetUpdateStrategy {
            type_: Some("OnDelete".to_string()),
            ..Default::default()
        }),
        NdbNodeType::Mysqld => None,
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(ndb.get_workload_name(node_type)),
            namespace: ndb.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(ndb)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(desired_replicas(summary, node_type)),
            service_name: Some(ndb.get_service_name(node_type)),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy,
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Hash of a pod template, stored on the StatefulSet to detect drift
/// between the desired and the applied template.
pub fn pod_template_hash(template: &PodTemplateSpec) -> String {
    // Serializing a k8s-openapi value cannot fail; an empty fallback would
    // only cause one redundant patch.
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn pod_template(
    ndb: &NdbCluster,
    summary: &ConfigSummary,
    node_type: NdbNodeType,
    labels: &BTreeMap<String, String>,
) -> PodTemplateSpec {
    let mut annotations = BTreeMap::new();
    if node_type == NdbNodeType::Mysqld && summary.my_cnf_generation > 0 {
        annotations.insert(
            MY_CNF_VERSION_ANNOTATION.to_string(),
            summary.my_cnf_generation.to_string(),
        );
    }

    let container = match node_type {
        NdbNodeType::Mgmd => mgmd_container(ndb),
        NdbNodeType::Ndbd => ndbd_container(ndb, summary),
        NdbNodeType::Mysqld => mysqld_container(ndb, summary),
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
            containers: vec![container],
            volumes: Some(volumes(ndb, summary, node_type)),
            ..Default::default()
        }),
    }
}

/// Comma separated connectstring listing all management nodes, using the
/// in-namespace short DNS form so the template is independent of the
/// cluster domain.
fn management_connectstring(ndb: &NdbCluster, summary: &ConfigSummary) -> String {
    let mgmd_count = desired_replicas(summary, NdbNodeType::Mgmd);
    (0..mgmd_count)
        .map(|i| {
            format!(
                "{}-{}.{}:{}",
                ndb.get_workload_name(NdbNodeType::Mgmd),
                i,
                ndb.get_service_name(NdbNodeType::Mgmd),
                NDB_PORT
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn mgmd_container(ndb: &NdbCluster) -> Container {
    Container {
        name: "mgmd".to_string(),
        image: Some(ndb.image()),
        image_pull_policy: Some(ndb.spec.image.pull_policy.clone()),
        command: Some(vec![
            "ndb_mgmd".to_string(),
            "-f".to_string(),
            format!("{DATA_DIR}/config/{CONFIG_INI_KEY}"),
            format!("--configdir={DATA_DIR}"),
            "--initial".to_string(),
            "--nodaemon".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: NDB_PORT,
            name: Some("mgmd".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            data_volume_mount(),
            VolumeMount {
                name: "config-volume".to_string(),
                mount_path: format!("{DATA_DIR}/config"),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(tcp_probe(NDB_PORT)),
        ..Default::default()
    }
}

fn ndbd_container(ndb: &NdbCluster, summary: &ConfigSummary) -> Container {
    Container {
        name: "ndbmtd".to_string(),
        image: Some(ndb.image()),
        image_pull_policy: Some(ndb.spec.image.pull_policy.clone()),
        command: Some(vec![
            "ndbmtd".to_string(),
            "--nodaemon".to_string(),
            "-c".to_string(),
            management_connectstring(ndb, summary),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: NDB_PORT,
            name: Some("ndbd".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![data_volume_mount()]),
        readiness_probe: Some(tcp_probe(NDB_PORT)),
        ..Default::default()
    }
}

fn mysqld_container(ndb: &NdbCluster, summary: &ConfigSummary) -> Container {
    let (secret_name, _) = ndb.get_root_password_secret_name();

    let mut args = Vec::new();
    if summary.my_cnf_generation > 0 {
        // defaults options must precede all others
        args.push(format!("--defaults-extra-file=/etc/ndb-mysqld/{MY_CNF_KEY}"));
    }
    args.push("--ndbcluster".to_string());
    args.push(format!(
        "--ndb-connectstring={}",
        management_connectstring(ndb, summary)
    ));

    let mut volume_mounts = vec![data_volume_mount()];
    if summary.my_cnf_generation > 0 {
        volume_mounts.push(VolumeMount {
            name: "mysqld-cnf-volume".to_string(),
            mount_path: "/etc/ndb-mysqld".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Container {
        name: "mysqld".to_string(),
        image: Some(ndb.image()),
        image_pull_policy: Some(ndb.spec.image.pull_policy.clone()),
        args: Some(args),
        env: Some(vec![EnvVar {
            name: "MYSQL_ROOT_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name,
                    key: ROOT_PASSWORD_KEY.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: MYSQLD_PORT,
            name: Some("mysqld".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(tcp_probe(MYSQLD_PORT)),
        ..Default::default()
    }
}

fn data_volume_mount() -> VolumeMount {
    VolumeMount {
        name: "ndb-data".to_string(),
        mount_path: DATA_DIR.to_string(),
        ..Default::default()
    }
}

fn volumes(ndb: &NdbCluster, summary: &ConfigSummary, node_type: NdbNodeType) -> Vec<Volume> {
    let mut volumes = vec![Volume {
        name: "ndb-data".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];

    match node_type {
        NdbNodeType::Mgmd => volumes.push(Volume {
            name: "config-volume".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: ndb.get_config_map_name(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        NdbNodeType::Mysqld if summary.my_cnf_generation > 0 => volumes.push(Volume {
            name: "mysqld-cnf-volume".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: ndb.get_config_map_name(),
                items: Some(vec![k8s_openapi::api::core::v1::KeyToPath {
                    key: MY_CNF_KEY.to_string(),
                    path: MY_CNF_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        _ => {}
    }

    volumes
}

fn tcp_probe(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}
