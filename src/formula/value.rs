//! Runtime values seen by formulas and the attribute bags that carry them.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    List(Vec<Value>),
    Document(AttributeBag),
}

/// Static kind of a value, used by the type checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Null,
    Bool,
    Number,
    String,
    Date,
    Array,
    Document,
    /// Not known until evaluation.
    Any,
}

impl Kind {
    /// Whether two kinds may meet in a comparison.
    pub fn compatible(self, other: Kind) -> bool {
        match (self, other) {
            (Kind::Any, _) | (_, Kind::Any) | (Kind::Null, _) | (_, Kind::Null) => true,
            (Kind::Date, Kind::String) | (Kind::String, Kind::Date) => true,
            (a, b) => a == b,
        }
    }

    /// Whether values of this kind have an order.
    pub fn orderable(self) -> bool {
        matches!(
            self,
            Kind::Number | Kind::String | Kind::Date | Kind::Any | Kind::Null
        )
    }

    /// Whether a value of this kind can stand where `expected` is required.
    pub fn satisfies(self, expected: Kind) -> bool {
        self == expected || matches!(self, Kind::Any | Kind::Null) || expected == Kind::Any
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Date => "date",
            Kind::Array => "array",
            Kind::Document => "document",
            Kind::Any => "any",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) | Value::Float(_) => Kind::Number,
            Value::Str(_) => Kind::String,
            Value::Date(_) => Kind::Date,
            Value::List(_) => Kind::Array,
            Value::Document(_) => Kind::Document,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Dates compare against ISO `YYYY-MM-DD` strings as well as date values.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Str(s) => NaiveDate::parse_from_str(s, DATE_FORMAT).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Equality for non-null operands. `None` means the kinds cannot be compared.
    pub fn loose_eq(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (a, b) if a.kind() == Kind::Number && b.kind() == Kind::Number => {
                Some(a.as_f64() == b.as_f64())
            }
            (Value::Date(a), b @ Value::Str(_)) | (b @ Value::Str(_), Value::Date(a)) => {
                Some(b.as_date() == Some(*a))
            }
            (a, b) if a.kind() == b.kind() => Some(a == b),
            _ => None,
        }
    }

    /// Ordering for non-null operands. `None` means no order exists between them.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(_), _) | (_, Value::Date(_)) => {
                Some(self.as_date()?.cmp(&other.as_date()?))
            }
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Document(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Date(d) => Json::String(d.format(DATE_FORMAT).to_string()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(bag) => bag.to_json(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Json::deserialize(deserializer).map(|json| Value::from_json(&json))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

impl From<AttributeBag> for Value {
    fn from(bag: AttributeBag) -> Self {
        Value::Document(bag)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A named set of attributes: a user, an environment, a row or a computed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeBag(BTreeMap<String, Value>);

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Walk a dotted path through nested documents.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(first.as_ref())?;
        for segment in rest {
            match current {
                Value::Document(bag) => current = bag.0.get(segment.as_ref())?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of `self` with every attribute of `overlay` written over it.
    pub fn merged(&self, overlay: &AttributeBag) -> AttributeBag {
        let mut out = self.clone();
        for (key, value) in overlay.iter() {
            out.0.insert(key.clone(), value.clone());
        }
        out
    }

    /// Replace the value of every attribute not accepted by `keep` with null.
    pub fn mask(&mut self, mut keep: impl FnMut(&str) -> bool) {
        for (key, value) in self.0.iter_mut() {
            if !keep(key) {
                *value = Value::Null;
            }
        }
    }

    pub fn from_json(json: &Json) -> Option<AttributeBag> {
        match Value::from_json(json) {
            Value::Document(bag) => Some(bag),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        Json::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for AttributeBag {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        AttributeBag(iter.into_iter().collect())
    }
}

impl IntoIterator for AttributeBag {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a AttributeBag {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for AttributeBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttributeBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        AttributeBag::from_json(&json)
            .ok_or_else(|| serde::de::Error::custom("attribute bag must be a JSON object"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_keeps_numbers_apart() {
        let bag = AttributeBag::from_json(&json!({
            "salary": 110000,
            "ratio": 0.5,
            "roles": ["admin"],
            "address": { "city": "NY" }
        }))
        .unwrap();
        assert_eq!(bag.get("salary"), Some(&Value::Int(110000)));
        assert_eq!(bag.get("ratio"), Some(&Value::Float(0.5)));
        assert_eq!(
            bag.get_path(&["address", "city"]),
            Some(&Value::Str("NY".into()))
        );
        assert_eq!(bag.to_json()["roles"], json!(["admin"]));
    }

    #[test]
    fn test_non_object_is_not_a_bag() {
        assert!(AttributeBag::from_json(&json!([1, 2])).is_none());
        assert!(serde_json::from_str::<AttributeBag>("42").is_err());
    }

    #[test]
    fn test_dates_compare_with_iso_strings() {
        let date = Value::Date(NaiveDate::from_ymd_opt(2023, 5, 25).unwrap());
        assert_eq!(date.loose_eq(&Value::from("2023-05-25")), Some(true));
        assert_eq!(
            date.sql_cmp(&Value::from("2023-06-01")),
            Some(Ordering::Less)
        );
        assert_eq!(date.loose_eq(&Value::from("not a date")), Some(false));
    }

    #[test]
    fn test_mixed_numbers_are_equal() {
        assert_eq!(Value::Int(3).loose_eq(&Value::Float(3.0)), Some(true));
        assert_eq!(
            Value::Int(2).sql_cmp(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_incomparable_kinds() {
        assert_eq!(Value::from("a").loose_eq(&Value::Int(1)), None);
        assert_eq!(Value::from("a").sql_cmp(&Value::Int(1)), None);
        assert_eq!(Value::Null.loose_eq(&Value::Null), None);
    }

    #[test]
    fn test_merge_and_mask() {
        let base = AttributeBag::new().with("a", 1).with("b", 2);
        let merged = base.merged(&AttributeBag::new().with("b", 3));
        assert_eq!(merged.get("b"), Some(&Value::Int(3)));

        let mut masked = merged.clone();
        masked.mask(|k| k == "a");
        assert_eq!(masked.get("a"), Some(&Value::Int(1)));
        assert_eq!(masked.get("b"), Some(&Value::Null));
    }
}
