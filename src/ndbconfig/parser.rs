//! Minimal ini-style parser for MySQL Cluster configuration files.
//!
//! The NDB configuration format allows the same section header to appear
//! many times (one `[ndbd]` section per data node), which rules out
//! map-backed ini crates. Sections are kept in file order.

use std::collections::BTreeMap;

use crate::ndbconfig::ConfigError;

/// A single `[name]` section and its `key=value` entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: BTreeMap<String, String>,
}

/// A parsed configuration file: an ordered list of sections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigIni {
    pub sections: Vec<Section>,
}

impl ConfigIni {
    /// Parse a configuration text. Comment lines (`#` or `;`) and blank
    /// lines are skipped; any other line must be a section header or a
    /// `key=value` entry inside a section.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = ConfigIni::default();
        let mut current: Option<Section> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') {
                    return Err(ConfigError::InvalidEntry(line_no, raw_line.to_string()));
                }
                let name = line[1..line.len() - 1].trim();
                if name.is_empty() {
                    return Err(ConfigError::EmptySectionName(line_no));
                }
                if let Some(section) = current.take() {
                    config.sections.push(section);
                }
                current = Some(Section {
                    name: name.to_string(),
                    entries: BTreeMap::new(),
                });
                continue;
            }

            let Some(section) = current.as_mut() else {
                return Err(ConfigError::LineWithoutSection(line_no));
            };

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidEntry(line_no, raw_line.to_string()));
            };
            section
                .entries
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        if let Some(section) = current.take() {
            config.sections.push(section);
        }

        Ok(config)
    }

    /// The first section with the given name.
    pub fn first_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Number of sections with the given name.
    pub fn number_of_sections(&self, name: &str) -> usize {
        self.sections.iter().filter(|s| s.name == name).count()
    }

    /// Look up a value in the first section with the given name.
    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.first_section(section)
            .and_then(|s| s.entries.get(key))
            .map(String::as_str)
    }
}
