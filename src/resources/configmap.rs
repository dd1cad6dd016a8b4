//! ConfigMap generation for the cluster configuration.
//!
//! The ConfigMap is the only state carried across reconciliations: it holds
//! the authoritative `config.ini` (and the generated `my.cnf` when the spec
//! provides one).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::NdbCluster;
use crate::resources::common::{owner_reference, standard_labels};

/// Key of the cluster configuration inside the ConfigMap.
pub const CONFIG_INI_KEY: &str = "config.ini";

/// Key of the MySQL Server configuration inside the ConfigMap.
pub const MY_CNF_KEY: &str = "my.cnf";

/// Generate the ConfigMap carrying the given configuration texts.
pub fn new_config_map(ndb: &NdbCluster, config_ini: String, my_cnf: Option<String>) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_INI_KEY.to_string(), config_ini);
    if let Some(my_cnf) = my_cnf {
        data.insert(MY_CNF_KEY.to_string(), my_cnf);
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(ndb.get_config_map_name()),
            namespace: ndb.namespace(),
            labels: Some(standard_labels(ndb)),
            owner_references: Some(vec![owner_reference(ndb)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Extract the stored configuration texts from a ConfigMap. The config.ini
/// is required; my.cnf is optional.
pub fn get_config_from_config_map(cm: &ConfigMap) -> (Option<&String>, Option<&String>) {
    let data = cm.data.as_ref();
    (
        data.and_then(|d| d.get(CONFIG_INI_KEY)),
        data.and_then(|d| d.get(MY_CNF_KEY)),
    )
}
