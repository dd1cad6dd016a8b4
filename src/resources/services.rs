//! Service generation for the MySQL Cluster node types.
//!
//! Every node type gets a governing headless service for stable DNS names.
//! Management servers and MySQL Servers additionally get a LoadBalancer
//! service (`-ext` suffix) exposing them outside the cluster; the
//! management one also serves the operator itself when it runs
//! out-of-cluster.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{NdbCluster, NdbNodeType, MYSQLD_PORT, NDB_PORT};
use crate::resources::common::{owner_reference, pod_selector_labels, standard_labels};

/// Port served by the given node type.
pub fn service_port(node_type: NdbNodeType) -> i32 {
    match node_type {
        NdbNodeType::Mgmd | NdbNodeType::Ndbd => NDB_PORT,
        NdbNodeType::Mysqld => MYSQLD_PORT,
    }
}

/// Name of the service for a node type; LoadBalancer services carry an
/// `-ext` suffix next to the headless service name.
pub fn service_name(ndb: &NdbCluster, node_type: NdbNodeType, load_balancer: bool) -> String {
    let name = ndb.get_service_name(node_type);
    if load_balancer {
        format!("{name}-ext")
    } else {
        name
    }
}

/// Generate a service for the given node type.
pub fn new_service(ndb: &NdbCluster, node_type: NdbNodeType, load_balancer: bool) -> Service {
    let port = service_port(node_type);

    let spec = if load_balancer {
        ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(pod_selector_labels(ndb, node_type)),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                name: Some(node_type.as_str().to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    } else {
        ServiceSpec {
            cluster_ip: Some("None".to_string()),
            // Nodes must be resolvable before they are ready so the cluster
            // can assemble itself.
            publish_not_ready_addresses: Some(true),
            selector: Some(pod_selector_labels(ndb, node_type)),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                name: Some(node_type.as_str().to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    };

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(ndb, node_type, load_balancer)),
            namespace: ndb.namespace(),
            labels: Some(standard_labels(ndb)),
            owner_references: Some(vec![owner_reference(ndb)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Address and port a LoadBalancer service is reachable at, preferring the
/// ingress address and falling back to the cluster IP.
pub fn service_address_and_port(svc: &Service) -> Option<(String, i32)> {
    let spec = svc.spec.as_ref()?;
    let port = spec.ports.as_ref()?.first()?.port;

    let ingress_address = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()));

    let address = ingress_address.or_else(|| {
        spec.cluster_ip
            .clone()
            .filter(|ip| !ip.is_empty() && ip != "None")
    })?;

    Some((address, port))
}
