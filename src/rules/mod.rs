//! Rule engine: declarative constraints over records
//!
//! - **Predicate**: primitive tests (`is_present`, `has_value`, `is_type`, ...)
//! - **Expr**: typed boolean AST over predicate calls
//! - **Parser**: text → `Expr`
//! - **RuleSet / RuleRegistry**: named rules per entity kind and type

pub mod predicate;
pub mod expr;
pub mod parser;
pub mod ruleset;

pub use predicate::EvalError;
pub use expr::{Expr, Predicate};
pub use parser::{parse_expr, ParseError};
pub use ruleset::{
    FailureKind, ResolvedRules, Rule, RuleError, RuleFailure, RuleRegistry, RuleSet,
    AUTHORIZED_KEYS_RULE,
};
