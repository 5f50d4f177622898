//! Runtime values, the render context, and the operator coercion policy.
//!
//! The policy in one place:
//!
//! - Falsy: `Undefined`, `Null`, `false`, `0`, `0.0`, `""`, `[]`, `{}`.
//! - Display: `Undefined` and `Null` print nothing. Integral numbers print
//!   without a fractional part no matter whether they arrived as integers or
//!   floats (`42.0` prints `42`). Lists and maps print as JSON.
//! - `+` adds numbers, concatenates lists, and concatenates display forms as
//!   soon as one side is a string (a missing value counts as empty there).
//! - `- * / // %` are numeric only. `/` always yields a float.
//! - Ordering works on numbers and on strings, nothing else.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// A lookup that found nothing. Only `default` turns it into something.
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Text that must not be HTML-escaped again.
    Safe(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) | Value::Safe(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Safe(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) | Value::Safe(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Converts any serializable host value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value(value).map(Value::from)
    }

    /// Looks up `key` the way `a.b` and `a[b]` do. Misses yield `Undefined`.
    pub fn get_item(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::Map(m), Value::String(k) | Value::Safe(k)) => {
                m.get(k).cloned().unwrap_or_default()
            }
            (Value::Map(m), Value::Int(i)) => m.get(&i.to_string()).cloned().unwrap_or_default(),
            (Value::List(l), Value::Int(i)) => {
                index_from_end(l.len(), *i).and_then(|i| l.get(i)).cloned().unwrap_or_default()
            }
            (Value::String(s) | Value::Safe(s), Value::Int(i)) => {
                let count = s.chars().count();
                index_from_end(count, *i)
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_default()
            }
            _ => Value::Undefined,
        }
    }

    /// Equality used by `==`, `in` and the `unique` filter.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => a.as_f64() == b.as_f64(),
            (Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            _ => false,
        }
    }

    pub fn contains(&self, needle: &Value) -> Result<bool, String> {
        match self {
            Value::Undefined | Value::Null => Ok(false),
            Value::String(h) | Value::Safe(h) => match needle.as_str() {
                Some(n) => Ok(h.contains(n)),
                None => Ok(h.contains(&needle.to_string())),
            },
            Value::List(l) => Ok(l.iter().any(|v| v.loose_eq(needle))),
            Value::Map(m) => Ok(match needle {
                Value::String(k) | Value::Safe(k) => m.contains_key(k),
                Value::Int(i) => m.contains_key(&i.to_string()),
                _ => false,
            }),
            other => Err(format!("`in` needs a string, list or map, got {}", other.type_name())),
        }
    }

    pub fn compare(&self, other: &Value) -> Result<std::cmp::Ordering, String> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_number() && b.is_number() => {
                let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
                a.partial_cmp(&b).ok_or_else(|| "cannot order NaN".to_string())
            }
            (Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => Ok(a.cmp(b)),
            (a, b) => Err(format!("cannot order {} and {}", a.type_name(), b.type_name())),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, String> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a
                .checked_add(*b)
                .map_or_else(|| Value::Float(*a as f64 + *b as f64), Value::Int)),
            (a, b) if a.is_number() && b.is_number() => {
                Ok(Value::Float(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default()))
            }
            (Value::List(a), Value::List(b)) => Ok(Value::List(a.iter().chain(b).cloned().collect())),
            (a, b) if is_stringish(a) && is_stringish(b) && (a.as_str().is_some() || b.as_str().is_some()) => {
                Ok(Value::String(format!("{a}{b}")))
            }
            (a, b) => Err(format!("cannot add {} and {}", a.type_name(), b.type_name())),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, String> {
        arith(self, other, "subtract", i64::checked_sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, String> {
        arith(self, other, "multiply", i64::checked_mul, |a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Result<Value, String> {
        let (a, b) = numbers(self, other, "divide")?;
        if b == 0.0 {
            return Err("division by zero".to_string());
        }
        Ok(Value::Float(a / b))
    }

    pub fn floor_div(&self, other: &Value) -> Result<Value, String> {
        if let (Value::Int(a), Value::Int(b)) = (self, other) {
            if *b == 0 {
                return Err("division by zero".to_string());
            }
            if let (Some(q), Some(r)) = (a.checked_div_euclid(*b), a.checked_rem_euclid(*b)) {
                return Ok(Value::Int(q - i64::from(*b < 0 && r != 0)));
            }
        }
        let (a, b) = numbers(self, other, "divide")?;
        if b == 0.0 {
            return Err("division by zero".to_string());
        }
        Ok(Value::Float((a / b).floor()))
    }

    pub fn rem(&self, other: &Value) -> Result<Value, String> {
        if let (Value::Int(a), Value::Int(b)) = (self, other) {
            if *b == 0 {
                return Err("modulo by zero".to_string());
            }
            // Result takes the sign of the divisor.
            if let Some(r) = a.checked_rem(*b) {
                return Ok(Value::Int(if r != 0 && (r < 0) != (*b < 0) { r + b } else { r }));
            }
        }
        let (a, b) = numbers(self, other, "take the remainder of")?;
        if b == 0.0 {
            return Err("modulo by zero".to_string());
        }
        Ok(Value::Float(a - b * (a / b).floor()))
    }

    pub fn neg(&self) -> Result<Value, String> {
        match self {
            Value::Int(i) => Ok(i.checked_neg().map_or(Value::Float(-(*i as f64)), Value::Int)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(format!("cannot negate {}", other.type_name())),
        }
    }
}

fn is_stringish(v: &Value) -> bool {
    matches!(
        v,
        Value::String(_) | Value::Safe(_) | Value::Int(_) | Value::Float(_) | Value::Undefined | Value::Null
    )
}

fn index_from_end(len: usize, i: i64) -> Option<usize> {
    if i < 0 {
        len.checked_sub(i.unsigned_abs() as usize)
    } else {
        Some(i as usize)
    }
}

fn numbers(a: &Value, b: &Value, verb: &str) -> Result<(f64, f64), String> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(format!("cannot {verb} {} and {}", a.type_name(), b.type_name())),
    }
}

fn arith(
    a: &Value,
    b: &Value,
    verb: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return Ok(int_op(*x, *y).map_or_else(|| Value::Float(float_op(*x as f64, *y as f64)), Value::Int));
    }
    let (x, y) = numbers(a, b, verb)?;
    Ok(Value::Float(float_op(x, y)))
}

/// Formats a float following the integral-display rule.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined | Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::String(s) | Value::Safe(s) => f.write_str(s),
            Value::List(_) | Value::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::String(s) | Value::Safe(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(entries) => {
                Value::Map(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        i64::try_from(i).map_or(Value::Float(i as f64), Value::Int)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(m: BTreeMap<String, V>) -> Self {
        Value::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<V: Into<Value>, S> From<HashMap<String, V, S>> for Value {
    fn from(m: HashMap<String, V, S>) -> Self {
        Value::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Caller-supplied root data. Rendering only ever reads it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Builder form of [`set_var`](Self::set_var).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_var(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Builds a context from any serializable map-shaped value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(entries) => Ok(Self {
                vars: entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            }),
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "context must be a map, got {other}"
            ))),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(vars: BTreeMap<String, Value>) -> Self {
        Self { vars }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn falsy_values() {
        for v in [
            Value::Undefined,
            Value::Null,
            Value::Bool(false),
            Value::Int(0),
            Value::Float(0.0),
            Value::from(""),
            Value::List(vec![]),
            Value::Map(BTreeMap::new()),
        ] {
            assert!(!v.is_truthy(), "{v:?} should be falsy");
        }
        for v in [Value::Bool(true), Value::Int(-1), Value::from("0"), Value::from(vec![0])] {
            assert!(v.is_truthy(), "{v:?} should be truthy");
        }
    }

    #[test]
    fn integral_numbers_display_without_fraction() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(42.0).to_string(), "42");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(-0.25).to_string(), "-0.25");
        assert_eq!(Value::Float(1e20).to_string(), "100000000000000000000");
    }

    #[test]
    fn containers_display_as_json() {
        let v = Value::from(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(v.to_string(), r#"[1,"a"]"#);
    }

    #[test]
    fn add_coercions() {
        assert_eq!(Value::Int(1).add(&Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(1).add(&Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(Value::from("n=").add(&Value::Int(3)).unwrap(), Value::from("n=3"));
        assert_eq!(Value::Undefined.add(&Value::from("x")).unwrap(), Value::from("x"));
        assert!(Value::Undefined.add(&Value::Int(1)).is_err());
        assert!(Value::Bool(true).add(&Value::Int(1)).is_err());
        assert_eq!(
            Value::Int(i64::MAX).add(&Value::Int(1)).unwrap(),
            Value::Float(i64::MAX as f64 + 1.0)
        );
    }

    #[test]
    fn division_and_modulo() {
        assert_eq!(Value::Int(10).div(&Value::Int(4)).unwrap(), Value::Float(2.5));
        assert_eq!(Value::Int(-7).floor_div(&Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(Value::Int(7).floor_div(&Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(-7).rem(&Value::Int(3)).unwrap(), Value::Int(2));
        assert!(Value::Int(1).div(&Value::Int(0)).is_err());
        assert!(Value::from("a").sub(&Value::Int(1)).is_err());
    }

    #[test]
    fn loose_equality_across_numbers_and_safe_strings() {
        assert!(Value::Int(1).loose_eq(&Value::Float(1.0)));
        assert!(Value::Safe("a".into()).loose_eq(&Value::from("a")));
        assert!(Value::Undefined.loose_eq(&Value::Null));
        assert!(!Value::Int(1).loose_eq(&Value::from("1")));
    }

    #[test]
    fn item_access_misses_are_undefined() {
        let list = Value::from(vec![1, 2, 3]);
        assert_eq!(list.get_item(&Value::Int(-1)), Value::Int(3));
        assert_eq!(list.get_item(&Value::Int(7)), Value::Undefined);
        assert_eq!(Value::Int(3).get_item(&Value::from("x")), Value::Undefined);
    }

    #[test]
    fn context_from_serialize_requires_a_map() {
        #[derive(Serialize)]
        struct User {
            name: &'static str,
            age: u32,
        }
        let ctx = Context::from_serialize(&User { name: "Alice", age: 30 }).unwrap();
        assert_eq!(ctx.get("age"), Some(&Value::Int(30)));
        assert!(Context::from_serialize(&[1, 2]).is_err());
    }
}
