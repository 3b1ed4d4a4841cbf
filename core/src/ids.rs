//! Identifier canonicalization.
//!
//! RULE: every identifier that crosses a record-set boundary goes through
//! `canonical_id` first. Source systems hand back the same account number as
//! an integer, a float, or zero-padded text depending on the query; joins only
//! work once all of them collapse to one string form.

use crate::{
    error::{R360Error, R360Result},
    types::{KeyId, PartyId},
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A cell as it arrives from a tabular source, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self { RawValue::Int(v) }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self { RawValue::Int(v as i64) }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self { RawValue::Real(v) }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self { RawValue::Text(v.to_string()) }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self { RawValue::Text(v) }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(RawValue::Null)
    }
}

impl From<rusqlite::types::Value> for RawValue {
    fn from(v: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value;
        match v {
            Value::Null       => RawValue::Null,
            Value::Integer(i) => RawValue::Int(i),
            Value::Real(f)    => RawValue::Real(f),
            Value::Text(s)    => RawValue::Text(s),
            Value::Blob(b)    => RawValue::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

impl RawValue {
    /// Text view of a non-identifier cell (status codes, address lines).
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::Null    => None,
            RawValue::Int(i)  => Some(i.to_string()),
            RawValue::Real(f) => Some(f.to_string()),
            RawValue::Text(s) => {
                let t = s.trim();
                if t.is_empty() { None } else { Some(t.to_string()) }
            }
        }
    }
}

/// Canonicalize an identifier cell. `Ok(None)` means the cell was empty.
///
/// - integers render as decimal
/// - integral floats drop their fraction (`100.0` → `"100"`)
/// - decimal text drops leading zeros and a zero fraction, keeping any sign
///   (`"-05.0"` → `"-5"`), the same as the numeric forms
/// - other text is trimmed and must be ASCII alphanumeric, `-` or `_`
pub fn canonical_id(record_set: &str, column: &str, raw: &RawValue) -> R360Result<Option<String>> {
    let bad = |shown: String| {
        R360Error::integrity(
            record_set,
            format!("column '{column}' holds unparseable identifier {shown}"),
        )
    };

    match raw {
        RawValue::Null   => Ok(None),
        RawValue::Int(i) => Ok(Some(i.to_string())),
        RawValue::Real(f) => {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
                Ok(Some((*f as i64).to_string()))
            } else {
                Err(bad(f.to_string()))
            }
        }
        RawValue::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                return Ok(None);
            }
            if let Some(number) = decimal_text(t) {
                return Ok(Some(number));
            }
            if t.contains('.') {
                return Err(bad(format!("'{s}'")));
            }
            if t.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
                Ok(Some(t.to_string()))
            } else {
                Err(bad(format!("'{s}'")))
            }
        }
    }
}

/// Canonical form of a decimal text id with an optional sign and an all-zero
/// fraction (`"-05.00"` → `"-5"`), or `None` if `t` is not one.
fn decimal_text(t: &str) -> Option<String> {
    let (negative, unsigned) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let (whole, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if whole.is_empty()
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b == b'0')
    {
        return None;
    }
    let stripped = whole.trim_start_matches('0');
    Some(match (stripped.is_empty(), negative) {
        (true, _)      => "0".into(),
        (false, true)  => format!("-{stripped}"),
        (false, false) => stripped.into(),
    })
}

/// Same as `canonical_id` but an empty cell is an error.
pub fn required_id(record_set: &str, column: &str, raw: &RawValue) -> R360Result<String> {
    canonical_id(record_set, column, raw)?.ok_or_else(|| {
        R360Error::integrity(record_set, format!("column '{column}' is empty"))
    })
}

pub fn person_party(persnbr: &str) -> PartyId {
    format!("P{persnbr}")
}

pub fn org_party(orgnbr: &str) -> PartyId {
    format!("O{orgnbr}")
}

/// Ordering for canonical ids: digit-only ids compare by numeric value and
/// sort before anything alphanumeric, which compares lexicographically.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let a_num = !a.is_empty() && a.bytes().all(|c| c.is_ascii_digit());
    let b_num = !b.is_empty() && b.bytes().all(|c| c.is_ascii_digit());
    match (a_num, b_num) {
        (true, true)   => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (true, false)  => Ordering::Less,
        (false, true)  => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Numeric value of a key id, if it is a canonical decimal key.
pub fn key_number(key: &KeyId) -> Option<u64> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    key.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: RawValue) -> Option<String> {
        canonical_id("accounts", "acctnbr", &raw).unwrap()
    }

    #[test]
    fn numeric_and_text_forms_collapse() {
        assert_eq!(canon(RawValue::Int(100)), Some("100".into()));
        assert_eq!(canon(RawValue::Real(100.0)), Some("100".into()));
        assert_eq!(canon("100".into()), Some("100".into()));
        assert_eq!(canon(" 00100 ".into()), Some("100".into()));
        assert_eq!(canon("100.0".into()), Some("100".into()));
        assert_eq!(canon("0".into()), Some("0".into()));
    }

    #[test]
    fn signed_ids_agree_across_forms() {
        for raw in [
            RawValue::Int(-5),
            RawValue::Real(-5.0),
            "-5".into(),
            "-05".into(),
            "-5.0".into(),
        ] {
            assert_eq!(canon(raw), Some("-5".into()));
        }
        assert_eq!(canon("-0".into()), Some("0".into()));
        assert_eq!(canon(RawValue::Real(-0.0)), Some("0".into()));
    }

    #[test]
    fn empty_cells_are_absent() {
        assert_eq!(canon(RawValue::Null), None);
        assert_eq!(canon("   ".into()), None);
    }

    #[test]
    fn alphanumeric_ids_pass_through() {
        assert_eq!(canon("IOLTA-7".into()), Some("IOLTA-7".into()));
    }

    #[test]
    fn unparseable_ids_are_integrity_errors() {
        for raw in [
            RawValue::Real(100.5),
            RawValue::Real(f64::NAN),
            RawValue::Text("12 34".into()),
            RawValue::Text("100.5".into()),
            RawValue::Text("-100.5".into()),
            RawValue::Text("1.0.0".into()),
            RawValue::Text("abc$".into()),
        ] {
            let err = canonical_id("accounts", "acctnbr", &raw).unwrap_err();
            assert!(matches!(err, R360Error::DataIntegrity { .. }), "{raw:?} gave {err}");
        }
    }

    #[test]
    fn natural_order_is_numeric_first() {
        let mut ids = vec!["101", "A7", "20", "3", "A10"];
        ids.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(ids, vec!["3", "20", "101", "A10", "A7"]);
    }

    #[test]
    fn key_numbers_require_canonical_decimal() {
        assert_eq!(key_number(&"42".to_string()), Some(42));
        assert_eq!(key_number(&"042".to_string()), None);
        assert_eq!(key_number(&"K42".to_string()), None);
    }
}
