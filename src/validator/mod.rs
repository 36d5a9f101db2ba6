//! Validator: checks a whole descriptor against the rule registry
//!
//! Two passes:
//! - **Per-entity**: every record against its resolved rule sets. Nodes,
//!   modules and connections are checked on separate scoped threads.
//! - **Cross-entity**: name/id uniqueness and references between entities,
//!   run once all per-entity checks have joined.
//!
//! Validation only reads the descriptor. Every failure is collected; nothing
//! stops at the first one.

use crate::model::{ConnectionView, Descriptor, EntityId, EntityKind, ModuleView};
use crate::record::Record;
use crate::rules::{FailureKind, RuleError, RuleFailure, RuleRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Category of a failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A rule evaluated to false, or an unauthorized key
    Schema,
    /// A predicate met a value of the wrong type
    TypeMismatch,
    /// A name or id conflicts with, or points at, another entity
    Referential,
}

/// One failed rule on one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule: String,
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Violation {
    pub fn schema(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            kind: ViolationKind::Schema,
            detail: None,
        }
    }

    fn referential(rule: &str, detail: String) -> Self {
        Self {
            rule: rule.to_string(),
            kind: ViolationKind::Referential,
            detail: Some(detail),
        }
    }
}

impl From<RuleFailure> for Violation {
    fn from(failure: RuleFailure) -> Self {
        let (kind, detail) = match failure.kind {
            FailureKind::Violated => (ViolationKind::Schema, None),
            FailureKind::TypeMismatch(e) => (ViolationKind::TypeMismatch, Some(e.to_string())),
            FailureKind::UnauthorizedKeys(keys) => (
                ViolationKind::Schema,
                Some(format!("unexpected keys: {}", keys.join(", "))),
            ),
        };
        Self {
            rule: failure.rule,
            kind,
            detail,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.rule, detail),
            None => f.write_str(&self.rule),
        }
    }
}

/// All violations of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailures {
    pub entity: EntityId,
    pub violations: Vec<Violation>,
}

impl EntityFailures {
    pub fn failed_rules(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.rule.as_str()).collect()
    }
}

/// Outcome of a validation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// Sorted by entity kind, then position
    Invalid(Vec<EntityFailures>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn failures(&self) -> &[EntityFailures] {
        match self {
            ValidationResult::Valid => &[],
            ValidationResult::Invalid(failures) => failures,
        }
    }

    pub fn failures_for(&self, kind: EntityKind, index: usize) -> Option<&EntityFailures> {
        self.failures()
            .iter()
            .find(|f| f.entity.kind == kind && f.entity.index == index)
    }

    pub fn violation_count(&self) -> usize {
        self.failures().iter().map(|f| f.violations.len()).sum()
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationResult::Valid => write!(f, "valid"),
            ValidationResult::Invalid(failures) => {
                writeln!(f, "{} violation(s):", self.violation_count())?;
                for entity in failures {
                    for v in &entity.violations {
                        writeln!(f, "  {}: {}", entity.entity, v)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Runs the rule registry over descriptors
#[derive(Debug, Clone)]
pub struct Validator {
    registry: Arc<RuleRegistry>,
}

impl Validator {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self { registry }
    }

    /// Validator over the built-in rule files
    pub fn builtin() -> Result<Self, RuleError> {
        Ok(Self::new(Arc::new(RuleRegistry::builtin()?)))
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Check one record against the rules of its kind and type
    pub fn check_record(&self, kind: EntityKind, record: &Record) -> Vec<Violation> {
        self.registry
            .resolve_for(kind, record)
            .check(record)
            .into_iter()
            .map(Violation::from)
            .collect()
    }

    pub fn validate(&self, descriptor: &Descriptor) -> ValidationResult {
        let per_entity: Vec<(EntityId, Vec<Violation>)> = std::thread::scope(|s| {
            let handles: Vec<_> = EntityKind::ALL
                .iter()
                .map(|&kind| s.spawn(move || self.check_kind(descriptor, kind)))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut merged: BTreeMap<EntityId, Vec<Violation>> = BTreeMap::new();
        for (entity, violations) in per_entity {
            merged.entry(entity).or_default().extend(violations);
        }
        for (entity, violation) in cross_check(descriptor) {
            merged.entry(entity).or_default().push(violation);
        }

        if merged.is_empty() {
            log::debug!("Descriptor valid ({} entities)", descriptor.entity_count());
            return ValidationResult::Valid;
        }

        let failures: Vec<EntityFailures> = merged
            .into_iter()
            .map(|(entity, violations)| EntityFailures { entity, violations })
            .collect();
        log::info!(
            "Descriptor invalid: {} entities with violations",
            failures.len()
        );
        ValidationResult::Invalid(failures)
    }

    fn check_kind(&self, descriptor: &Descriptor, kind: EntityKind) -> Vec<(EntityId, Vec<Violation>)> {
        descriptor
            .records(kind)
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let violations = self.check_record(kind, record);
                if violations.is_empty() {
                    None
                } else {
                    Some((descriptor.entity_id(kind, index), violations))
                }
            })
            .collect()
    }
}

fn cross_check(descriptor: &Descriptor) -> Vec<(EntityId, Violation)> {
    let mut out = Vec::new();

    for kind in EntityKind::ALL {
        let rule = format!("{} names must be unique", kind);
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (index, record) in descriptor.records(kind).iter().enumerate() {
            let Some(name) = record.get_str("name") else {
                continue;
            };
            if let Some(&first) = seen.get(name) {
                out.push((
                    descriptor.entity_id(kind, index),
                    Violation::referential(&rule, format!("'{}' already used by {} #{}", name, kind, first)),
                ));
            } else {
                seen.insert(name, index);
            }
        }
    }

    let mut ids: HashMap<u16, usize> = HashMap::new();
    for (index, record) in descriptor.connections.iter().enumerate() {
        let conn = ConnectionView::new(record);
        let (true, Some(id)) = (conn.is_established(), conn.id()) else {
            continue;
        };
        if let Some(&first) = ids.get(&id) {
            out.push((
                descriptor.entity_id(EntityKind::Connection, index),
                Violation::referential(
                    "connection ids must be unique",
                    format!("id {} already used by connection #{}", id, first),
                ),
            ));
        } else {
            ids.insert(id, index);
        }
    }

    let nodes: HashSet<&str> = descriptor.nodes.iter().filter_map(|r| r.get_str("name")).collect();
    for (index, record) in descriptor.modules.iter().enumerate() {
        let module = ModuleView::new(record);
        for (field, target) in [("node", module.node()), ("old_node", module.old_node())] {
            if let Some(target) = target.filter(|t| !nodes.contains(t)) {
                out.push((
                    descriptor.entity_id(EntityKind::Module, index),
                    Violation::referential(
                        &format!("{} must reference an existing node", field),
                        format!("no node named '{}'", target),
                    ),
                ));
            }
        }
    }

    let modules: HashSet<&str> = descriptor.modules.iter().filter_map(|r| r.get_str("name")).collect();
    for (index, record) in descriptor.connections.iter().enumerate() {
        let conn = ConnectionView::new(record);
        for (field, target) in [("from_module", conn.from_module()), ("to_module", conn.to_module())] {
            if let Some(target) = target.filter(|t| !modules.contains(t)) {
                out.push((
                    descriptor.entity_id(EntityKind::Connection, index),
                    Violation::referential(
                        &format!("{} must reference an existing module", field),
                        format!("no module named '{}'", target),
                    ),
                ));
            }
        }
    }

    out
}
