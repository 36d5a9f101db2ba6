//! Predicate Library: primitive boolean tests over a single record
//!
//! Every function here is pure. Presence is always judged with
//! [`Record::get`], so an explicit `null` counts as "not present".

use crate::record::{Record, Value, ValueType};
use std::collections::BTreeSet;

/// Default width for `is_positive_number` (a TCP/UDP port)
pub const DEFAULT_NUMBER_BITS: u32 = 16;

/// Rule evaluation errors. Surfaced as a failed rule, never a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("field '{field}' is {found}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// `field` exists and is not an explicit null
pub fn is_present(record: &Record, field: &str) -> bool {
    record.get(field).is_some()
}

/// `field` is present and equal to `value`. Values of a different type are
/// simply unequal; type conformance is a separate rule.
pub fn has_value(record: &Record, field: &str, value: &Value) -> bool {
    record.get(field).is_some_and(|v| v == value)
}

/// Absence-tolerant type check: absent, or present with type `ty`
pub fn is_type(record: &Record, field: &str, ty: ValueType) -> bool {
    match record.get(field) {
        None => true,
        Some(v) => v.value_type() == Some(ty),
    }
}

/// Integer in `1 ..= 2^bits - 1`. Absent is false; any non-integer value is
/// a `TypeMismatch`.
pub fn is_positive_number(record: &Record, field: &str, bits: u32) -> Result<bool, EvalError> {
    let Some(value) = record.get(field) else {
        return Ok(false);
    };
    let n = value.as_int().ok_or_else(|| EvalError::TypeMismatch {
        field: field.to_string(),
        expected: "integer",
        found: value.kind_name(),
    })?;
    let max = if bits >= 63 { i64::MAX } else { (1i64 << bits) - 1 };
    Ok((1..=max).contains(&n))
}

/// Every key of the record, including null-valued ones, is in `allowed`
pub fn authorized_keys(record: &Record, allowed: &BTreeSet<String>) -> bool {
    record.keys().all(|k| allowed.contains(k))
}

/// Keys of the record that fall outside `allowed`
pub fn unauthorized_keys<'a>(record: &'a Record, allowed: &BTreeSet<String>) -> Vec<&'a str> {
    record.keys().filter(|k| !allowed.contains(*k)).collect()
}

/// False only when both fields are present and hold equal values
pub fn distinct(record: &Record, left: &str, right: &str) -> bool {
    match (record.get(left), record.get(right)) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Record {
        Record::new()
            .with("from_module", "m1")
            .with("to_module", "m2")
            .with("direct", false)
            .with("port", 2001)
            .with("empty", "")
    }

    #[test]
    fn test_is_present() {
        let mut rec = conn();
        assert!(is_present(&rec, "from_module"));
        assert!(is_present(&rec, "empty"));
        assert!(!is_present(&rec, "key"));

        rec.set("key", Value::Absent);
        assert!(!is_present(&rec, "key"));
    }

    #[test]
    fn test_has_value() {
        let rec = conn();
        assert!(has_value(&rec, "direct", &Value::Bool(false)));
        assert!(!has_value(&rec, "direct", &Value::Bool(true)));
        assert!(!has_value(&rec, "established", &Value::Bool(true)));
        assert!(!has_value(&rec, "to_module", &Value::Int(2)));
    }

    #[test]
    fn test_is_type_tolerates_absence() {
        let rec = conn();
        assert!(is_type(&rec, "to_module", ValueType::String));
        assert!(!is_type(&rec, "to_module", ValueType::Integer));
        assert!(is_type(&rec, "nonce", ValueType::Integer));
    }

    #[test]
    fn test_is_positive_number() {
        let rec = conn()
            .with("zero", 0)
            .with("max", 65535)
            .with("over", 65536)
            .with("neg", -1);
        assert_eq!(is_positive_number(&rec, "port", 16), Ok(true));
        assert_eq!(is_positive_number(&rec, "max", 16), Ok(true));
        assert_eq!(is_positive_number(&rec, "zero", 16), Ok(false));
        assert_eq!(is_positive_number(&rec, "over", 16), Ok(false));
        assert_eq!(is_positive_number(&rec, "neg", 16), Ok(false));
        assert_eq!(is_positive_number(&rec, "missing", 16), Ok(false));
        assert_eq!(is_positive_number(&rec, "over", 32), Ok(true));
    }

    #[test]
    fn test_is_positive_number_type_mismatch() {
        let rec = conn();
        let err = is_positive_number(&rec, "to_module", 16).unwrap_err();
        assert_eq!(
            err,
            EvalError::TypeMismatch {
                field: "to_module".into(),
                expected: "integer",
                found: "string",
            }
        );
    }

    #[test]
    fn test_authorized_keys() {
        let rec = conn();
        let mut allowed: BTreeSet<String> = ["from_module", "to_module", "direct", "port", "empty"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(authorized_keys(&rec, &allowed));

        allowed.remove("port");
        assert!(!authorized_keys(&rec, &allowed));
        assert_eq!(unauthorized_keys(&rec, &allowed), vec!["port"]);
    }

    #[test]
    fn test_distinct() {
        let rec = conn();
        assert!(distinct(&rec, "from_module", "to_module"));
        assert!(distinct(&rec, "missing", "to_module"));

        let looped = rec.with("from_module", "m2");
        assert!(!distinct(&looped, "from_module", "to_module"));
    }
}
