//! Rule sets and the per-kind registry
//!
//! A rule set is an ordered list of named expressions plus the keys it
//! authorizes. Each entity kind has a default set; modules and nodes may add
//! a type-specific set chosen by exact match on their `type` field. The
//! registry resolves every `(kind, type)` pair once, when sets are added, so
//! validation never looks anything up per predicate.

use super::expr::Expr;
use super::parser::{parse_expr, ParseError};
use super::predicate::{self, EvalError};
use crate::model::EntityKind;
use crate::record::Record;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the synthetic closed-world rule added to every resolved set
pub const AUTHORIZED_KEYS_RULE: &str = "only authorized keys";

/// A named boolean constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub expr: Expr,
}

/// Why a rule did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The expression evaluated to false
    Violated,
    /// A predicate was applied to a value of the wrong type
    TypeMismatch(EvalError),
    /// Keys outside the authorized set
    UnauthorizedKeys(Vec<String>),
}

/// One failed rule on one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub rule: String,
    pub kind: FailureKind,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Violated => write!(f, "{}", self.rule),
            FailureKind::TypeMismatch(e) => write!(f, "{} ({})", self.rule, e),
            FailureKind::UnauthorizedKeys(keys) => {
                write!(f, "{} (unexpected: {})", self.rule, keys.join(", "))
            }
        }
    }
}

/// On-disk shape of a rule file
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    rules: serde_yaml::Mapping,
}

/// Ordered collection of named rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    /// Label used in errors and logs, e.g. `module/sancus`
    pub label: String,
    /// Keys this set authorizes
    pub fields: BTreeSet<String>,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fields: BTreeSet::new(),
            rules: Vec::new(),
        }
    }

    /// Parse a YAML rule file
    pub fn from_yaml(label: &str, text: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_yaml::from_str(text).map_err(|source| RuleError::Yaml {
            set: label.to_string(),
            source,
        })?;

        let mut set = RuleSet::new(label);
        set.fields = file.fields.into_iter().collect();

        for (name, expr) in file.rules {
            let (Some(name), Some(expr)) = (name.as_str(), expr.as_str()) else {
                return Err(RuleError::Malformed {
                    set: label.to_string(),
                    message: "rule names and expressions must be strings".into(),
                });
            };
            set.push(name, expr)?;
        }

        Ok(set)
    }

    /// Append a rule parsed from `expr`
    pub fn push(&mut self, name: &str, expr: &str) -> Result<(), RuleError> {
        if self.rules.iter().any(|r| r.name == name) {
            return Err(RuleError::Malformed {
                set: self.label.clone(),
                message: format!("duplicate rule '{}'", name),
            });
        }
        let expr = parse_expr(expr).map_err(|source| RuleError::Parse {
            set: self.label.clone(),
            rule: name.to_string(),
            source,
        })?;
        self.rules.push(Rule {
            name: name.to_string(),
            expr,
        });
        Ok(())
    }

    /// Evaluate every rule, collecting all failures
    pub fn evaluate(&self, record: &Record) -> Vec<RuleFailure> {
        self.rules
            .iter()
            .filter_map(|rule| match rule.expr.evaluate(record) {
                Ok(true) => None,
                Ok(false) => Some(RuleFailure {
                    rule: rule.name.clone(),
                    kind: FailureKind::Violated,
                }),
                Err(e) => Some(RuleFailure {
                    rule: rule.name.clone(),
                    kind: FailureKind::TypeMismatch(e),
                }),
            })
            .collect()
    }
}

/// The rule sets that apply to one `(kind, type)`, resolved ahead of time
#[derive(Debug, Clone)]
pub struct ResolvedRules {
    pub kind: EntityKind,
    /// `None` when only the default set applies
    pub entity_type: Option<String>,
    pub sets: Vec<Arc<RuleSet>>,
    pub authorized: BTreeSet<String>,
}

impl ResolvedRules {
    fn resolve(kind: EntityKind, entity_type: Option<&str>, sets: Vec<Arc<RuleSet>>) -> Self {
        let authorized = sets
            .iter()
            .flat_map(|s| s.fields.iter().cloned())
            .collect();
        Self {
            kind,
            entity_type: entity_type.map(str::to_string),
            sets,
            authorized,
        }
    }

    /// Run every rule of every set, then the closed-world key check
    pub fn check(&self, record: &Record) -> Vec<RuleFailure> {
        let mut failures: Vec<RuleFailure> =
            self.sets.iter().flat_map(|s| s.evaluate(record)).collect();

        if !predicate::authorized_keys(record, &self.authorized) {
            let extra = predicate::unauthorized_keys(record, &self.authorized)
                .into_iter()
                .map(str::to_string)
                .collect();
            failures.push(RuleFailure {
                rule: AUTHORIZED_KEYS_RULE.to_string(),
                kind: FailureKind::UnauthorizedKeys(extra),
            });
        }

        failures
    }

    /// Total number of rules, including the closed-world rule
    pub fn rule_count(&self) -> usize {
        self.sets.iter().map(|s| s.rules.len()).sum::<usize>() + 1
    }
}

#[derive(Debug, Clone)]
struct KindRules {
    default: Arc<RuleSet>,
    typed: HashMap<String, Arc<RuleSet>>,
    default_resolved: Arc<ResolvedRules>,
    resolved: HashMap<String, Arc<ResolvedRules>>,
}

impl KindRules {
    fn new(kind: EntityKind, default: RuleSet) -> Self {
        let default = Arc::new(default);
        let default_resolved = Arc::new(ResolvedRules::resolve(kind, None, vec![default.clone()]));
        Self {
            default,
            typed: HashMap::new(),
            default_resolved,
            resolved: HashMap::new(),
        }
    }

    fn rebuild(&mut self, kind: EntityKind) {
        self.default_resolved =
            Arc::new(ResolvedRules::resolve(kind, None, vec![self.default.clone()]));
        self.resolved = self
            .typed
            .iter()
            .map(|(ty, set)| {
                let sets = vec![self.default.clone(), set.clone()];
                (ty.clone(), Arc::new(ResolvedRules::resolve(kind, Some(ty), sets)))
            })
            .collect();
    }
}

const BUILTIN: &[(EntityKind, Option<&str>, &str)] = &[
    (EntityKind::Module, None, include_str!("../../rules/default/module.yaml")),
    (EntityKind::Node, None, include_str!("../../rules/default/node.yaml")),
    (EntityKind::Connection, None, include_str!("../../rules/default/connection.yaml")),
    (EntityKind::Module, Some("sancus"), include_str!("../../rules/modules/sancus.yaml")),
    (EntityKind::Module, Some("sgx"), include_str!("../../rules/modules/sgx.yaml")),
    (EntityKind::Module, Some("native"), include_str!("../../rules/modules/native.yaml")),
    (EntityKind::Module, Some("trustzone"), include_str!("../../rules/modules/trustzone.yaml")),
    (EntityKind::Node, Some("sancus"), include_str!("../../rules/nodes/sancus.yaml")),
    (EntityKind::Node, Some("sgx"), include_str!("../../rules/nodes/sgx.yaml")),
    (EntityKind::Node, Some("native"), include_str!("../../rules/nodes/native.yaml")),
    (EntityKind::Node, Some("trustzone"), include_str!("../../rules/nodes/trustzone.yaml")),
];

/// All rule sets, keyed by entity kind and type
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    kinds: HashMap<EntityKind, KindRules>,
}

impl RuleRegistry {
    /// Registry with an empty default set for every kind
    pub fn empty() -> Self {
        let kinds = EntityKind::ALL
            .iter()
            .map(|&kind| (kind, KindRules::new(kind, RuleSet::new(kind.default_label()))))
            .collect();
        Self { kinds }
    }

    /// Registry with the rule files shipped in the crate
    pub fn builtin() -> Result<Self, RuleError> {
        let mut registry = Self::empty();
        for (kind, ty, text) in BUILTIN {
            let label = match ty {
                Some(ty) => format!("{}/{}", kind.as_str(), ty),
                None => kind.default_label(),
            };
            let set = RuleSet::from_yaml(&label, text)?;
            match ty {
                Some(ty) => registry.set_typed(*kind, ty, set),
                None => registry.set_default(*kind, set),
            }
        }
        Ok(registry)
    }

    /// Built-in rules, overridden by any files found under `dir`:
    /// `default/<kind>.yaml` and `<kind>s/<type>.yaml`
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, RuleError> {
        let dir = dir.as_ref();
        let mut registry = Self::builtin()?;

        for kind in EntityKind::ALL {
            let default_path = dir.join("default").join(format!("{}.yaml", kind.as_str()));
            if default_path.exists() {
                let text = read_rule_file(&default_path)?;
                registry.set_default(kind, RuleSet::from_yaml(&kind.default_label(), &text)?);
            }

            let typed_dir = dir.join(format!("{}s", kind.as_str()));
            if !typed_dir.is_dir() {
                continue;
            }
            let entries = std::fs::read_dir(&typed_dir).map_err(|source| RuleError::Io {
                path: typed_dir.clone(),
                source,
            })?;
            for entry in entries {
                let path = entry
                    .map_err(|source| RuleError::Io {
                        path: typed_dir.clone(),
                        source,
                    })?
                    .path();
                if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                    continue;
                }
                let Some(ty) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let text = read_rule_file(&path)?;
                let label = format!("{}/{}", kind.as_str(), ty);
                registry.set_typed(kind, ty, RuleSet::from_yaml(&label, &text)?);
            }
        }

        log::info!("Loaded rule sets from {}", dir.display());
        Ok(registry)
    }

    /// Replace the default rule set of `kind`
    pub fn set_default(&mut self, kind: EntityKind, set: RuleSet) {
        let rules = self
            .kinds
            .entry(kind)
            .or_insert_with(|| KindRules::new(kind, RuleSet::new(kind.default_label())));
        rules.default = Arc::new(set);
        rules.rebuild(kind);
    }

    /// Add or replace the rule set layered on top of the default for `ty`
    pub fn set_typed(&mut self, kind: EntityKind, ty: &str, set: RuleSet) {
        let rules = self
            .kinds
            .entry(kind)
            .or_insert_with(|| KindRules::new(kind, RuleSet::new(kind.default_label())));
        rules.typed.insert(ty.to_string(), Arc::new(set));
        rules.rebuild(kind);
    }

    /// Rules for an entity of `kind` whose `type` field is `ty`.
    /// Unknown or missing types get the default set only.
    pub fn resolve(&self, kind: EntityKind, ty: Option<&str>) -> Arc<ResolvedRules> {
        let Some(rules) = self.kinds.get(&kind) else {
            return Arc::new(ResolvedRules::resolve(kind, None, Vec::new()));
        };
        match ty.and_then(|t| rules.resolved.get(t)) {
            Some(resolved) => resolved.clone(),
            None => {
                if let Some(t) = ty {
                    log::debug!("No {} rules for type '{}', using defaults only", kind.as_str(), t);
                }
                rules.default_resolved.clone()
            }
        }
    }

    /// Rules for a concrete record (reads its `type` field)
    pub fn resolve_for(&self, kind: EntityKind, record: &Record) -> Arc<ResolvedRules> {
        let ty = if kind.has_type() { record.get_str("type") } else { None };
        self.resolve(kind, ty)
    }

    /// Types with a dedicated rule set, sorted
    pub fn known_types(&self, kind: EntityKind) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .kinds
            .get(&kind)
            .map(|r| r.typed.keys().map(String::as_str).collect())
            .unwrap_or_default();
        types.sort_unstable();
        types
    }
}

fn read_rule_file(path: &Path) -> Result<String, RuleError> {
    std::fs::read_to_string(path).map_err(|source| RuleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Rule loading errors
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule '{rule}' in {set}: {source}")]
    Parse {
        set: String,
        rule: String,
        #[source]
        source: ParseError,
    },

    #[error("invalid rule file {set}: {source}")]
    Yaml {
        set: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid rule file {set}: {message}")]
    Malformed { set: String, message: String },

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(failures: &[RuleFailure]) -> Vec<&str> {
        failures.iter().map(|f| f.rule.as_str()).collect()
    }

    #[test]
    fn test_builtin_rules_load() {
        let registry = RuleRegistry::builtin().unwrap();
        assert_eq!(
            registry.known_types(EntityKind::Module),
            vec!["native", "sancus", "sgx", "trustzone"]
        );
        assert!(registry.known_types(EntityKind::Connection).is_empty());

        let conn = registry.resolve(EntityKind::Connection, None);
        assert!(conn.authorized.contains("established"));
        assert!(conn.rule_count() > 20);
    }

    #[test]
    fn test_type_specific_rules_layer_on_defaults() {
        let registry = RuleRegistry::builtin().unwrap();
        let sancus = registry.resolve(EntityKind::Module, Some("sancus"));
        assert_eq!(sancus.sets.len(), 2);
        assert!(sancus.authorized.contains("files"));
        assert!(sancus.authorized.contains("node"));

        let unknown = registry.resolve(EntityKind::Module, Some("keystone"));
        assert_eq!(unknown.sets.len(), 1);
        assert_eq!(unknown.entity_type, None);
        assert!(!unknown.authorized.contains("files"));
    }

    #[test]
    fn test_check_collects_every_failure() {
        let registry = RuleRegistry::builtin().unwrap();
        let rules = registry.resolve(EntityKind::Node, Some("sancus"));
        let record = Record::new()
            .with("type", "sancus")
            .with("name", "n1")
            .with("reactive_port", "2001")
            .with("colour", "blue");

        let failures = rules.check(&record);
        let failed = names(&failures);
        assert!(failed.contains(&"host mandatory"));
        assert!(failed.contains(&"vendor_id mandatory"));
        assert!(failed.contains(&"vendor_key mandatory"));
        assert!(failed.contains(&"reactive_port must be a positive 16-bit number"));
        assert_eq!(failed.last(), Some(&AUTHORIZED_KEYS_RULE));

        let port = failures
            .iter()
            .find(|f| f.rule == "reactive_port must be a positive 16-bit number")
            .unwrap();
        assert!(matches!(port.kind, FailureKind::TypeMismatch(_)));
        assert_eq!(
            failures.last().unwrap().kind,
            FailureKind::UnauthorizedKeys(vec!["colour".into()])
        );
    }

    #[test]
    fn test_rules_keep_file_order() {
        let set = RuleSet::from_yaml(
            "test",
            "fields: [a]\nrules:\n  second: \"is_present(a)\"\n  first: \"is_present(b)\"\n",
        )
        .unwrap();
        let order: Vec<&str> = set.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["second", "first"]);
    }

    #[test]
    fn test_bad_rule_reports_name() {
        let err = RuleSet::from_yaml("test", "rules:\n  broken: \"is_present(a\"\n").unwrap_err();
        match err {
            RuleError::Parse { rule, .. } => assert_eq!(rule, "broken"),
            other => panic!("unexpected error: {other}"),
        }

        let err = RuleSet::from_yaml("test", "rules:\n  numeric: 3\n").unwrap_err();
        assert!(matches!(err, RuleError::Malformed { .. }));
    }

    #[test]
    fn test_from_dir_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("modules")).unwrap();
        std::fs::write(
            dir.path().join("modules").join("keystone.yaml"),
            "fields: [enclave_size]\nrules:\n  \"enclave_size mandatory\": \"is_present(enclave_size)\"\n",
        )
        .unwrap();

        let registry = RuleRegistry::from_dir(dir.path()).unwrap();
        let keystone = registry.resolve(EntityKind::Module, Some("keystone"));
        assert_eq!(keystone.sets.len(), 2);
        assert!(keystone.authorized.contains("enclave_size"));
        // built-ins are still there
        assert_eq!(registry.resolve(EntityKind::Module, Some("sgx")).sets.len(), 2);
    }
}
