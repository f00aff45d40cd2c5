//! Flattening of structured configuration into hierarchical key/value pairs
//!
//! A configuration tree is stored in the registry as one entry per scalar, keyed by
//! the slash-delimited path to that scalar:
//!
//! | Input                           | Pairs                                 |
//! |---------------------------------|---------------------------------------|
//! | `{ "Writable": { "LogLevel": "INFO" } }` | `Writable/LogLevel = INFO`   |
//! | `{ "Hosts": ["a", "b"] }`       | `Hosts/0 = a`, `Hosts/1 = b`          |
//! | `{ "Port": 59880, "Tls": false }` | `Port = 59880`, `Tls = false`       |
//! | `{ "Secret": null }`            | `Secret = ` (empty string)            |
//!
//! Empty maps and empty sequences produce no pairs. The inverse, [`from_pairs`],
//! rebuilds the tree and decodes it into any deserializable type.

mod de;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub use de::{DecodeError, from_pairs};

pub const PATH_SEPARATOR: char = '/';

/// A single flattened configuration entry
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Flatten a JSON tree into ordered key/value pairs
pub fn flatten(value: &Value) -> Vec<KvPair> {
    let mut pairs = Vec::new();
    flatten_into(value, String::new(), &mut pairs);
    pairs
}

/// Flatten any serializable value
pub fn flatten_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<KvPair>> {
    Ok(flatten(&serde_json::to_value(value)?))
}

/// Flatten a TOML document
pub fn flatten_toml(value: &toml::Value) -> Vec<KvPair> {
    flatten(&toml_to_json(value))
}

fn flatten_into(value: &Value, path: String, pairs: &mut Vec<KvPair>) {
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                flatten_into(child, join(&path, name), pairs);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(child, join(&path, &index.to_string()), pairs);
            }
        }
        Value::Null => pairs.push(KvPair::new(path, "")),
        Value::Bool(b) => pairs.push(KvPair::new(path, b.to_string())),
        Value::Number(n) => pairs.push(KvPair::new(path, n.to_string())),
        Value::String(s) => pairs.push(KvPair::new(path, s.clone())),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent, PATH_SEPARATOR, name)
    }
}

/// Convert a TOML tree to JSON. Datetimes become their RFC 3339 text.
pub fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Rebuild an untyped tree from pairs, inferring scalar types
pub fn unflatten(pairs: &[KvPair]) -> Result<Value> {
    from_pairs(pairs)
}

/// Strip `prefix/` from each key, keeping only keys under the prefix
pub fn relative_to(prefix: &str, pairs: Vec<KvPair>) -> Vec<KvPair> {
    let prefix = prefix.trim_end_matches(PATH_SEPARATOR);
    pairs
        .into_iter()
        .filter_map(|pair| {
            if prefix.is_empty() {
                return Some(pair);
            }
            if pair.key == prefix {
                return Some(KvPair::new("", pair.value));
            }
            pair.key
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix(PATH_SEPARATOR))
                .map(|rest| KvPair::new(rest, pair.value.clone()))
        })
        .collect()
}
