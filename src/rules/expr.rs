//! Rule AST: typed boolean formulas over predicate calls

use super::predicate::{self, EvalError};
use crate::record::{Record, Value, ValueType};
use std::collections::BTreeSet;
use std::fmt;

/// One call into the predicate library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    IsPresent { field: String },
    HasValue { field: String, value: Value },
    IsType { field: String, ty: ValueType },
    IsPositiveNumber { field: String, bits: u32 },
    AuthorizedKeys { keys: BTreeSet<String> },
    Distinct { left: String, right: String },
}

impl Predicate {
    pub fn evaluate(&self, record: &Record) -> Result<bool, EvalError> {
        match self {
            Predicate::IsPresent { field } => Ok(predicate::is_present(record, field)),
            Predicate::HasValue { field, value } => {
                Ok(predicate::has_value(record, field, value))
            }
            Predicate::IsType { field, ty } => Ok(predicate::is_type(record, field, *ty)),
            Predicate::IsPositiveNumber { field, bits } => {
                predicate::is_positive_number(record, field, *bits)
            }
            Predicate::AuthorizedKeys { keys } => Ok(predicate::authorized_keys(record, keys)),
            Predicate::Distinct { left, right } => Ok(predicate::distinct(record, left, right)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::IsPresent { field } => write!(f, "is_present({})", field),
            Predicate::HasValue { field, value } => write!(f, "has_value({}, {})", field, value),
            Predicate::IsType { field, ty } => write!(f, "is_type({}, {})", field, ty.name()),
            Predicate::IsPositiveNumber { field, bits } => {
                if *bits == predicate::DEFAULT_NUMBER_BITS {
                    write!(f, "is_positive_number({})", field)
                } else {
                    write!(f, "is_positive_number({}, {})", field, bits)
                }
            }
            Predicate::AuthorizedKeys { keys } => {
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                write!(f, "authorized_keys([{}])", keys.join(", "))
            }
            Predicate::Distinct { left, right } => write!(f, "distinct({}, {})", left, right),
        }
    }
}

/// Boolean formula. `and`/`or` short-circuit left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(bool),
    Pred(Predicate),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Xor(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn not(inner: Expr) -> Self {
        Expr::Not(Box::new(inner))
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::Or(Box::new(left), Box::new(right))
    }

    pub fn xor(left: Expr, right: Expr) -> Self {
        Expr::Xor(Box::new(left), Box::new(right))
    }

    /// `not a or b`
    pub fn implies(a: Expr, b: Expr) -> Self {
        Expr::or(Expr::not(a), b)
    }

    pub fn evaluate(&self, record: &Record) -> Result<bool, EvalError> {
        match self {
            Expr::Const(b) => Ok(*b),
            Expr::Pred(p) => p.evaluate(record),
            Expr::Not(inner) => Ok(!inner.evaluate(record)?),
            Expr::And(l, r) => Ok(l.evaluate(record)? && r.evaluate(record)?),
            Expr::Or(l, r) => Ok(l.evaluate(record)? || r.evaluate(record)?),
            Expr::Xor(l, r) => Ok(l.evaluate(record)? != r.evaluate(record)?),
        }
    }

    /// Every field name the expression reads
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Pred(p) => match p {
                Predicate::IsPresent { field }
                | Predicate::HasValue { field, .. }
                | Predicate::IsType { field, .. }
                | Predicate::IsPositiveNumber { field, .. } => {
                    out.insert(field);
                }
                Predicate::AuthorizedKeys { .. } => {}
                Predicate::Distinct { left, right } => {
                    out.insert(left);
                    out.insert(right);
                }
            },
            Expr::Not(inner) => inner.collect_fields(out),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Xor(l, r) => {
                l.collect_fields(out);
                r.collect_fields(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(b) => write!(f, "{}", b),
            Expr::Pred(p) => write!(f, "{}", p),
            Expr::Not(inner) => write!(f, "not {}", Parens(inner)),
            Expr::And(l, r) => write!(f, "{} and {}", Parens(l), Parens(r)),
            Expr::Or(l, r) => write!(f, "{} or {}", Parens(l), Parens(r)),
            Expr::Xor(l, r) => write!(f, "{} xor {}", Parens(l), Parens(r)),
        }
    }
}

/// Wraps compound sub-expressions in parentheses when printing
struct Parens<'a>(&'a Expr);

impl fmt::Display for Parens<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Expr::Const(_) | Expr::Pred(_) | Expr::Not(_) => write!(f, "{}", self.0),
            other => write!(f, "({})", other),
        }
    }
}
