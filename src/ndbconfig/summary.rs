//! Digest of a stored cluster configuration.
//!
//! The ConfigMap text is the authoritative record of what the operator last
//! tried to apply. Every reconciliation re-derives a [`ConfigSummary`] from
//! it before taking any action; a config that fails to parse stops the sync
//! outright since the operator itself generated it.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crd::NdbCluster;
use crate::ndbconfig::parser::ConfigIni;
use crate::ndbconfig::ConfigError;

/// Summary of one generation of the stored cluster configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigSummary {
    /// Monotone generation of the cluster config, starting at 1.
    pub config_generation: u32,
    /// The NdbCluster spec generation that produced this config.
    pub resource_generation: i64,
    /// Hash of the spec slice that feeds the cluster config.
    pub config_hash: String,
    /// Monotone generation of the MySQL Server config (my.cnf).
    pub my_cnf_generation: u32,
    /// NoOfReplicas declared in the config.
    pub redundancy_level: i32,
    /// Number of `[ndbd]` sections.
    pub num_of_data_nodes: i32,
    /// Number of `[mysqld]` sections.
    pub num_of_mysql_servers: i32,
    /// Number of free `[api]` sections.
    pub num_of_free_api_slots: i32,
}

impl ConfigSummary {
    /// Rebuild the summary from the stored `config.ini` (and `my.cnf`,
    /// when present) text.
    pub fn from_config_text(config: &str, my_cnf: Option<&str>) -> Result<Self, ConfigError> {
        let ini = ConfigIni::parse(config)?;

        let config_generation = parse_value(&ini, "system", "ConfigGenerationNumber")?;
        let redundancy_level = parse_value(&ini, "ndbd default", "NoOfReplicas")?;

        let resource_generation = header_value(config, "NdbClusterGeneration")
            .ok_or_else(|| ConfigError::MissingKey("NdbClusterGeneration".to_string()))?
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "NdbClusterGeneration".to_string(),
                value: header_value(config, "NdbClusterGeneration").unwrap_or_default(),
            })?;
        let config_hash = header_value(config, "ConfigHash")
            .ok_or_else(|| ConfigError::MissingKey("ConfigHash".to_string()))?;

        let my_cnf_generation = match my_cnf {
            Some(text) => header_value(text, "ConfigVersion")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| ConfigError::MissingKey("ConfigVersion".to_string()))?,
            None => 0,
        };

        Ok(Self {
            config_generation,
            resource_generation,
            config_hash,
            my_cnf_generation,
            redundancy_level,
            num_of_data_nodes: ini.number_of_sections("ndbd") as i32,
            num_of_mysql_servers: ini.number_of_sections("mysqld") as i32,
            num_of_free_api_slots: ini.number_of_sections("api") as i32,
        })
    }
}

/// The slice of the NdbCluster spec that feeds the cluster config. my.cnf
/// and the root account settings are deliberately excluded: changing them
/// must not trigger an NDB node rollout.
#[derive(Serialize)]
struct ConfigSourceSlice<'a> {
    redundancy_level: i32,
    node_count: i32,
    free_api_slots: i32,
    mysql_server_count: i32,
    data_node_config: &'a std::collections::BTreeMap<String, String>,
    management_node_config: &'a std::collections::BTreeMap<String, String>,
}

/// Hash of the config-feeding spec slice. Two specs with equal hashes
/// render equivalent cluster configs (up to the generation counter).
pub fn calculate_spec_hash(ndb: &NdbCluster) -> Result<String, ConfigError> {
    let slice = ConfigSourceSlice {
        redundancy_level: ndb.spec.redundancy_level,
        node_count: ndb.spec.node_count,
        free_api_slots: ndb.spec.free_api_slots,
        mysql_server_count: ndb.get_mysql_server_node_count(),
        data_node_config: &ndb.spec.data_node_config,
        management_node_config: &ndb.spec.management_node_config,
    };

    let bytes = serde_json::to_vec(&slice)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// The effective (non-comment) body of a stored my.cnf, used to detect
/// SQL-only config changes.
pub fn my_cnf_body(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Look up a `# Key=value` header comment in a generated config text.
fn header_value(text: &str, key: &str) -> Option<String> {
    let prefix = format!("# {key}=");
    text.lines()
        .take_while(|line| line.starts_with('#') || line.trim().is_empty())
        .find_map(|line| line.strip_prefix(&prefix))
        .map(str::to_string)
}

/// Parse a numeric value out of the first section with the given name.
fn parse_value<T: std::str::FromStr>(
    ini: &ConfigIni,
    section: &str,
    key: &str,
) -> Result<T, ConfigError> {
    let value = ini
        .get_value(section, key)
        .ok_or_else(|| ConfigError::MissingKey(format!("[{section}] {key}")))?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("[{section}] {key}"),
        value: value.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::{ImageSpec, MysqldSpec, NdbClusterSpec};
    use crate::ndbconfig::generator::{generate_config_text, generate_my_cnf};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn test_cluster() -> NdbCluster {
        NdbCluster {
            metadata: ObjectMeta {
                name: Some("example-ndb".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            spec: NdbClusterSpec {
                redundancy_level: 2,
                node_count: 4,
                free_api_slots: 3,
                data_node_config: BTreeMap::new(),
                management_node_config: BTreeMap::new(),
                image: ImageSpec::default(),
                mysqld: Some(MysqldSpec {
                    node_count: 2,
                    root_host: "%".to_string(),
                    my_cnf: Some("max_user_connections=42".to_string()),
                    ..Default::default()
                }),
            },
            status: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let ndb = test_cluster();
        let config = generate_config_text(&ndb, None, "default").unwrap();
        let my_cnf = generate_my_cnf(&ndb, None).unwrap();
        let summary = ConfigSummary::from_config_text(&config, Some(&my_cnf)).unwrap();

        assert_eq!(
            summary,
            ConfigSummary {
                config_generation: 1,
                resource_generation: 3,
                config_hash: calculate_spec_hash(&ndb).unwrap(),
                my_cnf_generation: 1,
                redundancy_level: 2,
                num_of_data_nodes: 4,
                num_of_mysql_servers: 2,
                num_of_free_api_slots: 3,
            }
        );
    }

    #[test]
    fn test_round_trip_after_bump() {
        let ndb = test_cluster();
        let first = generate_config_text(&ndb, None, "default").unwrap();
        let summary = ConfigSummary::from_config_text(&first, None).unwrap();

        let second = generate_config_text(&ndb, Some(&summary), "default").unwrap();
        let reparsed = ConfigSummary::from_config_text(&second, None).unwrap();
        assert_eq!(reparsed.config_generation, 2);
        assert_eq!(reparsed.my_cnf_generation, 0);
    }

    #[test]
    fn test_spec_hash_ignores_sql_only_settings() {
        let mut ndb = test_cluster();
        let base = calculate_spec_hash(&ndb).unwrap();

        ndb.spec.mysqld.as_mut().unwrap().my_cnf = Some("ndb-extra-logging=99".to_string());
        ndb.spec.mysqld.as_mut().unwrap().root_host = "10.0.0.%".to_string();
        assert_eq!(calculate_spec_hash(&ndb).unwrap(), base);

        ndb.spec.mysqld.as_mut().unwrap().node_count = 4;
        assert_ne!(calculate_spec_hash(&ndb).unwrap(), base);
    }

    #[test]
    fn test_spec_hash_tracks_tuning_blocks() {
        let mut ndb = test_cluster();
        let base = calculate_spec_hash(&ndb).unwrap();
        ndb.spec
            .data_node_config
            .insert("MaxNoOfTables".to_string(), "1024".to_string());
        assert_ne!(calculate_spec_hash(&ndb).unwrap(), base);
    }

    #[test]
    fn test_parse_failure_is_an_error() {
        assert!(ConfigSummary::from_config_text("garbage without sections", None).is_err());
        // a config without the header comments cannot be summarized
        let bare = "[system]\nConfigGenerationNumber=1\n\n[ndbd default]\nNoOfReplicas=2\n";
        assert!(matches!(
            ConfigSummary::from_config_text(bare, None),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_my_cnf_body_strips_generated_header() {
        let ndb = test_cluster();
        let rendered = generate_my_cnf(&ndb, None).unwrap();
        assert_eq!(my_cnf_body(&rendered), "[mysqld]\nmax_user_connections=42");
    }
}
