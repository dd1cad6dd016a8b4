//! Root password Secret generation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::crd::NdbCluster;
use crate::resources::common::{owner_reference, standard_labels};

/// Key of the password inside the Secret.
pub const ROOT_PASSWORD_KEY: &str = "password";

const GENERATED_PASSWORD_LENGTH: usize = 16;

/// Generate an operator-minted root password Secret. Only called when the
/// user did not supply their own Secret; the owner reference marks it for
/// deletion together with the MySQL Servers.
pub fn new_root_password_secret(ndb: &NdbCluster) -> Secret {
    let (name, _) = ndb.get_root_password_secret_name();

    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LENGTH)
        .map(char::from)
        .collect();

    let mut string_data = BTreeMap::new();
    string_data.insert(ROOT_PASSWORD_KEY.to_string(), password);

    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: ndb.namespace(),
            labels: Some(standard_labels(ndb)),
            owner_references: Some(vec![owner_reference(ndb)]),
            ..Default::default()
        },
        string_data: Some(string_data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}
