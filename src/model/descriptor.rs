//! Deployment descriptor: the `nodes` / `modules` / `connections` document
//!
//! Loaded from JSON or YAML, dumped back in either format after deployment.

use super::connection::ConnectionView;
use super::entity::{EntityId, EntityKind};
use super::module::{ModuleMut, ModuleView};
use super::node::NodeView;
use crate::record::Record;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Serialization format of a descriptor file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorFormat {
    #[default]
    Json,
    Yaml,
}

impl DescriptorFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorFormat::Json => "json",
            DescriptorFormat::Yaml => "yaml",
        }
    }
}

impl FromStr for DescriptorFormat {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(DescriptorFormat::Json),
            "yaml" | "yml" => Ok(DescriptorFormat::Yaml),
            other => Err(DescriptorError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for DescriptorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A whole deployment: every node, module and connection record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub nodes: Vec<Record>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub modules: Vec<Record>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub connections: Vec<Record>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Record>, D::Error> {
    Ok(Option::<Vec<Record>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Descriptor {
    pub fn from_str_as(text: &str, format: DescriptorFormat) -> Result<Self, DescriptorError> {
        match format {
            DescriptorFormat::Json => Ok(serde_json::from_str(text)?),
            DescriptorFormat::Yaml => Ok(serde_yaml::from_str(text)?),
        }
    }

    /// Try JSON first, then YAML
    pub fn from_str_any(text: &str) -> Result<(Self, DescriptorFormat), DescriptorError> {
        match serde_json::from_str(text) {
            Ok(descriptor) => Ok((descriptor, DescriptorFormat::Json)),
            Err(json_err) => match serde_yaml::from_str(text) {
                Ok(descriptor) => Ok((descriptor, DescriptorFormat::Yaml)),
                Err(yaml_err) => Err(DescriptorError::Unrecognized {
                    json: json_err.to_string(),
                    yaml: yaml_err.to_string(),
                }),
            },
        }
    }

    /// Load a descriptor file, detecting its format
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, DescriptorFormat), DescriptorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_any(&text)
    }

    pub fn to_string_as(&self, format: DescriptorFormat) -> Result<String, DescriptorError> {
        match format {
            DescriptorFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            DescriptorFormat::Yaml => Ok(serde_yaml::to_string(self)?),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>, format: DescriptorFormat) -> Result<(), DescriptorError> {
        let path = path.as_ref();
        let text = self.to_string_as(format)?;
        std::fs::write(path, text).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// SHA-256 over the canonical JSON form
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut h = Sha256::new();
        h.update(&canonical);
        h.update(b"reactive-descriptor-v1");
        hex::encode(h.finalize())
    }

    pub fn records(&self, kind: EntityKind) -> &[Record] {
        match kind {
            EntityKind::Node => &self.nodes,
            EntityKind::Module => &self.modules,
            EntityKind::Connection => &self.connections,
        }
    }

    /// Identity of the `index`-th record of `kind`
    pub fn entity_id(&self, kind: EntityKind, index: usize) -> EntityId {
        let name = self.records(kind).get(index).and_then(|r| r.get_str("name"));
        EntityId::new(kind, index, name)
    }

    pub fn node(&self, name: &str) -> Option<NodeView<'_>> {
        self.nodes
            .iter()
            .map(NodeView::new)
            .find(|n| n.name() == Some(name))
    }

    pub fn module(&self, name: &str) -> Option<ModuleView<'_>> {
        self.modules
            .iter()
            .map(ModuleView::new)
            .find(|m| m.name() == Some(name))
    }

    pub fn module_mut(&mut self, name: &str) -> Option<ModuleMut<'_>> {
        self.modules
            .iter_mut()
            .find(|r| r.get_str("name") == Some(name))
            .map(ModuleMut::new)
    }

    pub fn connection(&self, name: &str) -> Option<ConnectionView<'_>> {
        self.connections
            .iter()
            .map(ConnectionView::new)
            .find(|c| c.name() == Some(name))
    }

    pub fn entity_count(&self) -> usize {
        self.nodes.len() + self.modules.len() + self.connections.len()
    }

    pub fn summary(&self) -> String {
        let deployed = self
            .modules
            .iter()
            .filter(|r| ModuleView::new(r).is_deployed())
            .count();
        let established = self
            .connections
            .iter()
            .filter(|r| ConnectionView::new(r).is_established())
            .count();
        format!(
            "Descriptor | {} nodes | {} modules ({} deployed) | {} connections ({} established)",
            self.nodes.len(),
            self.modules.len(),
            deployed,
            self.connections.len(),
            established
        )
    }
}

/// Descriptor loading and saving errors
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML descriptor: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("descriptor is neither JSON ({json}) nor YAML ({yaml})")]
    Unrecognized { json: String, yaml: String },

    #[error("unknown descriptor format '{0}', expected json or yaml")]
    UnknownFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "nodes": [
            { "type": "native", "name": "node1", "host": "127.0.0.1", "reactive_port": 5000 }
        ],
        "modules": [
            { "type": "native", "name": "m1", "node": "node1" },
            { "type": "native", "name": "m2", "node": "node1", "deployed": true }
        ],
        "connections": [
            { "from_module": "m1", "from_output": "o", "to_module": "m2", "to_input": "i", "encryption": "aes" }
        ]
    }"#;

    #[test]
    fn test_load_json() {
        let (d, format) = Descriptor::from_str_any(SAMPLE).unwrap();
        assert_eq!(format, DescriptorFormat::Json);
        assert_eq!(d.entity_count(), 4);
        assert_eq!(d.module("m2").unwrap().node(), Some("node1"));
        assert!(d.module("m3").is_none());
        assert_eq!(
            d.entity_id(EntityKind::Module, 1),
            EntityId::new(EntityKind::Module, 1, Some("m2"))
        );
    }

    #[test]
    fn test_load_yaml_with_missing_collections() {
        let text = "nodes:\n  - type: sgx\n    name: n\n    host: h\n    reactive_port: 1\nconnections: ~\n";
        let (d, format) = Descriptor::from_str_any(text).unwrap();
        assert_eq!(format, DescriptorFormat::Yaml);
        assert_eq!(d.nodes.len(), 1);
        assert!(d.modules.is_empty());
        assert!(d.connections.is_empty());
    }

    #[test]
    fn test_rejects_garbage() {
        let err = Descriptor::from_str_any("nodes: [unclosed").unwrap_err();
        assert!(matches!(err, DescriptorError::Unrecognized { .. }));
    }

    #[test]
    fn test_save_and_reload_yaml() {
        let (d, _) = Descriptor::from_str_any(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yaml");
        d.save(&path, DescriptorFormat::Yaml).unwrap();

        let (reloaded, format) = Descriptor::load(&path).unwrap();
        assert_eq!(format, DescriptorFormat::Yaml);
        assert_eq!(reloaded, d);
        assert_eq!(reloaded.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let (mut d, _) = Descriptor::from_str_any(SAMPLE).unwrap();
        let before = d.fingerprint();
        d.connections[0].set("name", "c0");
        assert_ne!(d.fingerprint(), before);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("YAML".parse::<DescriptorFormat>().unwrap(), DescriptorFormat::Yaml);
        assert!("toml".parse::<DescriptorFormat>().is_err());
    }

    #[test]
    fn test_summary() {
        let (d, _) = Descriptor::from_str_any(SAMPLE).unwrap();
        assert_eq!(
            d.summary(),
            "Descriptor | 1 nodes | 2 modules (1 deployed) | 1 connections (0 established)"
        );
    }
}
