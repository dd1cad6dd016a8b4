//! Validation logic for the NdbCluster spec.
//!
//! `has_valid_spec` checks a spec on its own; `is_valid_spec_update` checks
//! a spec against the stored configuration of a running cluster and rejects
//! changes the operator cannot roll out.

use crate::controller::error::{Error, Result};
use crate::crd::{NdbCluster, MAX_NUMBER_OF_NODES};
use crate::ndbconfig::parser::ConfigIni;
use crate::ndbconfig::summary::calculate_spec_hash;
use crate::ndbconfig::{ConfigError, ConfigSummary};

/// Validate the NdbCluster spec.
pub fn has_valid_spec(ndb: &NdbCluster) -> Result<()> {
    let spec = &ndb.spec;

    if !(1..=4).contains(&spec.redundancy_level) {
        return Err(Error::Validation(format!(
            "spec.redundancyLevel must be between 1 and 4, got {}",
            spec.redundancy_level
        )));
    }

    if spec.node_count < 1 {
        return Err(Error::Validation(format!(
            "spec.nodeCount must be positive, got {}",
            spec.node_count
        )));
    }

    if spec.node_count % spec.redundancy_level != 0 {
        return Err(Error::Validation(format!(
            "spec.nodeCount should be a multiple of the spec.redundancyLevel(={})",
            spec.redundancy_level
        )));
    }

    if spec.free_api_slots < 0 {
        return Err(Error::Validation(
            "spec.freeAPISlots cannot be negative".to_string(),
        ));
    }

    if ndb.get_mysql_server_node_count() < 0 {
        return Err(Error::Validation(
            "spec.mysqld.nodeCount cannot be negative".to_string(),
        ));
    }

    let total = ndb.total_number_of_nodes();
    if total > MAX_NUMBER_OF_NODES {
        return Err(Error::Validation(format!(
            "total number of MySQL Cluster nodes ({total} = {} management, {} data, {} mysql \
             nodes and {} free API nodes) exceeds the allowed maximum of {MAX_NUMBER_OF_NODES}",
            ndb.get_management_node_count(),
            spec.node_count,
            ndb.get_mysql_server_node_count(),
            spec.free_api_slots
        )));
    }

    if let Some(secret_name) = ndb
        .spec
        .mysqld
        .as_ref()
        .and_then(|m| m.root_password_secret_name.as_deref())
    {
        if !is_dns1123_subdomain(secret_name) {
            return Err(Error::Validation(format!(
                "spec.mysqld.rootPasswordSecretName {secret_name:?} is not a valid DNS-1123 subdomain"
            )));
        }
    }

    if let Some(my_cnf) = ndb.get_my_cnf() {
        validate_my_cnf(my_cnf)?;
    }

    Ok(())
}

/// Validate a spec against the stored configuration of a running cluster.
/// Topology changes the operator cannot apply online are rejected here, the
/// same rules an admission webhook would enforce.
pub fn is_valid_spec_update(ndb: &NdbCluster, summary: &ConfigSummary) -> Result<()> {
    let spec = &ndb.spec;

    if spec.redundancy_level != summary.redundancy_level {
        return Err(Error::InvalidSpecUpdate(format!(
            "spec.redundancyLevel cannot be updated once MySQL Cluster has been started \
             (running: {}, requested: {})",
            summary.redundancy_level, spec.redundancy_level
        )));
    }

    if spec.node_count > summary.num_of_data_nodes {
        return Err(Error::InvalidSpecUpdate(
            "online add node is not supported by the operator yet".to_string(),
        ));
    }
    if spec.node_count < summary.num_of_data_nodes {
        return Err(Error::InvalidSpecUpdate(
            "spec.nodeCount cannot be reduced once MySQL Cluster has been started".to_string(),
        ));
    }

    if summary.redundancy_level == 1 {
        // A single replica cannot be restarted without losing the cluster,
        // so no config change can be rolled out.
        let new_hash = calculate_spec_hash(ndb)?;
        if new_hash != summary.config_hash {
            return Err(Error::InvalidSpecUpdate(
                "the operator cannot apply spec updates to a MySQL Cluster whose replica is 1"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

/// The my.cnf must parse as a single `[mysqld]` section; the section header
/// itself is optional.
fn validate_my_cnf(my_cnf: &str) -> Result<()> {
    let parsed = match ConfigIni::parse(my_cnf) {
        Ok(parsed) => parsed,
        // section header is missing as it is optional, retry with one
        Err(ConfigError::LineWithoutSection(_)) => {
            ConfigIni::parse(&format!("[mysqld]\n{my_cnf}"))
                .map_err(|e| Error::Validation(format!("spec.mysqld.myCnf: {e}")))?
        }
        Err(e) => return Err(Error::Validation(format!("spec.mysqld.myCnf: {e}"))),
    };

    if parsed.sections.len() != 1 || parsed.number_of_sections("mysqld") != 1 {
        return Err(Error::Validation(
            "spec.mysqld.myCnf can have only one mysqld section".to_string(),
        ));
    }

    Ok(())
}

/// DNS-1123 subdomain: dot separated labels of lowercase alphanumerics and
/// dashes, at most 253 characters.
fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}
