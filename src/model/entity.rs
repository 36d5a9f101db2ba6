//! Entity kinds and identities used in reports

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three kinds of record in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Node,
    Module,
    Connection,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Node, EntityKind::Module, EntityKind::Connection];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Module => "module",
            EntityKind::Connection => "connection",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "node" | "nodes" => Some(EntityKind::Node),
            "module" | "modules" => Some(EntityKind::Module),
            "connection" | "connections" => Some(EntityKind::Connection),
            _ => None,
        }
    }

    /// Whether records of this kind select extra rules through `type`
    pub fn has_type(&self) -> bool {
        !matches!(self, EntityKind::Connection)
    }

    pub fn default_label(&self) -> String {
        format!("{}/default", self.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an entity in its descriptor, plus its name when it has one
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub index: usize,
    pub name: Option<String>,
}

impl EntityId {
    pub fn new(kind: EntityKind, index: usize, name: Option<&str>) -> Self {
        Self {
            kind,
            index,
            name: name.map(str::to_string),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} '{}'", self.kind, name),
            None => write!(f, "{} #{}", self.kind, self.index),
        }
    }
}
