//! Lossless JSON serialization for cache payloads.
//!
//! Plain JSON cannot carry dates, byte blobs, `undefined` or non-finite
//! floats. [`serialize`] splits a [`Payload`] into a JSON document plus a list
//! of meta entries recording which paths hold such values, and [`deserialize`]
//! uses those entries to put them back.
//!
//! # Example
//!
//! ```
//! use qcache::serializer::{deserialize, serialize, Payload};
//!
//! let value = Payload::object([
//!   ("id", Payload::from(7)),
//!   ("deleted", Payload::Undefined),
//! ]);
//! let encoded = serialize(&value);
//! assert_eq!(deserialize(encoded.json, &encoded.meta).unwrap(), value);
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A value that can be cached, used as a key token, or sent over the wire.
///
/// Objects are kept in a `BTreeMap`, so two objects with the same fields
/// compare and serialize identically no matter the order they were built in.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Undefined,
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  String(String),
  Date(DateTime<Utc>),
  Bytes(Vec<u8>),
  Array(Vec<Payload>),
  Object(BTreeMap<String, Payload>),
}

impl Payload {
  /// Build an object from field/value pairs.
  pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Payload)>) -> Self {
    Payload::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
  }

  pub fn array(items: impl IntoIterator<Item = Payload>) -> Self {
    Payload::Array(items.into_iter().collect())
  }

  pub fn is_undefined(&self) -> bool {
    matches!(self, Payload::Undefined)
  }

  /// Look up a field of an object payload.
  pub fn get(&self, field: &str) -> Option<&Payload> {
    match self {
      Payload::Object(fields) => fields.get(field),
      _ => None,
    }
  }

  fn at_path_mut(&mut self, path: &[PathSegment]) -> Option<&mut Payload> {
    let mut node = self;
    for segment in path {
      node = match (node, segment) {
        (Payload::Array(items), PathSegment::Index(i)) => items.get_mut(*i)?,
        (Payload::Object(fields), PathSegment::Field(name)) => fields.get_mut(name)?,
        _ => return None,
      };
    }
    Some(node)
  }
}

impl From<Value> for Payload {
  fn from(value: Value) -> Self {
    match value {
      Value::Null => Payload::Null,
      Value::Bool(b) => Payload::Bool(b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => Payload::Int(i),
        None => n.as_f64().map_or(Payload::Null, Payload::Float),
      },
      Value::String(s) => Payload::String(s),
      Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
      Value::Object(fields) => {
        Payload::Object(fields.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
      }
    }
  }
}

impl From<&str> for Payload {
  fn from(s: &str) -> Self {
    Payload::String(s.to_string())
  }
}

impl From<String> for Payload {
  fn from(s: String) -> Self {
    Payload::String(s)
  }
}

impl From<bool> for Payload {
  fn from(b: bool) -> Self {
    Payload::Bool(b)
  }
}

impl From<i64> for Payload {
  fn from(i: i64) -> Self {
    Payload::Int(i)
  }
}

impl From<i32> for Payload {
  fn from(i: i32) -> Self {
    Payload::Int(i64::from(i))
  }
}

impl From<u32> for Payload {
  fn from(i: u32) -> Self {
    Payload::Int(i64::from(i))
  }
}

impl From<f64> for Payload {
  fn from(f: f64) -> Self {
    Payload::Float(f)
  }
}

impl From<DateTime<Utc>> for Payload {
  fn from(d: DateTime<Utc>) -> Self {
    Payload::Date(d)
  }
}

impl From<Vec<Payload>> for Payload {
  fn from(items: Vec<Payload>) -> Self {
    Payload::Array(items)
  }
}

// ============================================================================
// Meta entries
// ============================================================================

/// How a value at a meta path must be reconstituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
  /// RFC 3339 string holding a date
  Date,
  /// "NaN", "Infinity" or "-Infinity"
  NonFinite,
  /// `null` standing in for an absent value
  Undefined,
  /// Hex string holding raw bytes
  Bytes,
}

impl MetaKind {
  fn code(self) -> u64 {
    match self {
      MetaKind::Date => 1,
      MetaKind::NonFinite => 2,
      MetaKind::Undefined => 3,
      MetaKind::Bytes => 8,
    }
  }

  fn from_code(code: u64) -> Option<Self> {
    match code {
      1 => Some(MetaKind::Date),
      2 => Some(MetaKind::NonFinite),
      3 => Some(MetaKind::Undefined),
      8 => Some(MetaKind::Bytes),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
  Field(String),
  Index(usize),
}

/// One meta entry, encoded on the wire as `[kind, ...path]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct MetaEntry {
  pub kind: MetaKind,
  pub path: Vec<PathSegment>,
}

impl MetaEntry {
  fn new(kind: MetaKind, path: &[PathSegment]) -> Self {
    Self {
      kind,
      path: path.to_vec(),
    }
  }
}

impl From<MetaEntry> for Vec<Value> {
  fn from(entry: MetaEntry) -> Self {
    let mut out = Vec::with_capacity(entry.path.len() + 1);
    out.push(Value::from(entry.kind.code()));
    out.extend(entry.path.into_iter().map(|segment| match segment {
      PathSegment::Field(name) => Value::String(name),
      PathSegment::Index(i) => Value::from(i),
    }));
    out
  }
}

impl TryFrom<Vec<Value>> for MetaEntry {
  type Error = SerializeError;

  fn try_from(raw: Vec<Value>) -> Result<Self, Self::Error> {
    let mut parts = raw.into_iter();
    let kind = parts
      .next()
      .and_then(|v| v.as_u64())
      .and_then(MetaKind::from_code)
      .ok_or_else(|| SerializeError::InvalidMeta("missing or unknown kind".to_string()))?;

    let path = parts
      .map(|part| match part {
        Value::String(name) => Ok(PathSegment::Field(name)),
        Value::Number(n) => n
          .as_u64()
          .map(|i| PathSegment::Index(i as usize))
          .ok_or_else(|| SerializeError::InvalidMeta(format!("bad index {}", n))),
        other => Err(SerializeError::InvalidMeta(format!(
          "bad path segment {}",
          other
        ))),
      })
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self { kind, path })
  }
}

/// A payload split into plain JSON and the meta needed to restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Serialized {
  pub json: Value,
  #[serde(default)]
  pub meta: Vec<MetaEntry>,
}

impl Serialized {
  /// The `{json, meta}` envelope as a JSON value.
  pub fn to_value(&self) -> Value {
    let meta = self
      .meta
      .iter()
      .cloned()
      .map(|entry| Value::Array(entry.into()))
      .collect();

    let mut envelope = Map::new();
    envelope.insert("json".to_string(), self.json.clone());
    envelope.insert("meta".to_string(), Value::Array(meta));
    Value::Object(envelope)
  }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SerializeError {
  #[error("meta entry points at missing path {0}")]
  MissingPath(String),
  #[error("meta kind {kind:?} does not match the value at {path}")]
  KindMismatch { kind: MetaKind, path: String },
  #[error("invalid date {value:?}: {reason}")]
  InvalidDate { value: String, reason: String },
  #[error("invalid byte string at {path}: {reason}")]
  InvalidBytes { path: String, reason: String },
  #[error("invalid meta entry: {0}")]
  InvalidMeta(String),
  #[error("query key must serialize to an array")]
  NotAKey,
}

struct PathDisplay<'a>(&'a [PathSegment]);

impl fmt::Display for PathDisplay<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "$")?;
    for segment in self.0 {
      match segment {
        PathSegment::Field(name) => write!(f, ".{}", name)?,
        PathSegment::Index(i) => write!(f, "[{}]", i)?,
      }
    }
    Ok(())
  }
}

// ============================================================================
// Encode / decode
// ============================================================================

/// Split a payload into JSON plus meta.
pub fn serialize(value: &Payload) -> Serialized {
  let mut meta = Vec::new();
  let mut path = Vec::new();
  let json = encode(value, &mut path, &mut meta);
  Serialized { json, meta }
}

/// Rebuild a payload from JSON plus the meta produced by [`serialize`].
pub fn deserialize(json: Value, meta: &[MetaEntry]) -> Result<Payload, SerializeError> {
  let mut payload = Payload::from(json);

  for entry in meta {
    let path = PathDisplay(&entry.path).to_string();
    let node = payload
      .at_path_mut(&entry.path)
      .ok_or_else(|| SerializeError::MissingPath(path.clone()))?;
    *node = revive(entry.kind, node, &path)?;
  }

  Ok(payload)
}

fn encode(value: &Payload, path: &mut Vec<PathSegment>, meta: &mut Vec<MetaEntry>) -> Value {
  match value {
    Payload::Undefined => {
      meta.push(MetaEntry::new(MetaKind::Undefined, path));
      Value::Null
    }
    Payload::Null => Value::Null,
    Payload::Bool(b) => Value::Bool(*b),
    Payload::Int(i) => Value::from(*i),
    Payload::Float(f) => match Number::from_f64(*f) {
      Some(n) => Value::Number(n),
      None => {
        meta.push(MetaEntry::new(MetaKind::NonFinite, path));
        Value::String(non_finite_label(*f).to_string())
      }
    },
    Payload::String(s) => Value::String(s.clone()),
    Payload::Date(d) => {
      meta.push(MetaEntry::new(MetaKind::Date, path));
      Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
    Payload::Bytes(bytes) => {
      meta.push(MetaEntry::new(MetaKind::Bytes, path));
      Value::String(hex::encode(bytes))
    }
    Payload::Array(items) => Value::Array(
      items
        .iter()
        .enumerate()
        .map(|(i, item)| {
          path.push(PathSegment::Index(i));
          let encoded = encode(item, path, meta);
          path.pop();
          encoded
        })
        .collect(),
    ),
    Payload::Object(fields) => {
      let mut out = Map::new();
      for (name, item) in fields {
        path.push(PathSegment::Field(name.clone()));
        out.insert(name.clone(), encode(item, path, meta));
        path.pop();
      }
      Value::Object(out)
    }
  }
}

fn revive(kind: MetaKind, node: &Payload, path: &str) -> Result<Payload, SerializeError> {
  match (kind, node) {
    (MetaKind::Undefined, Payload::Null) => Ok(Payload::Undefined),
    (MetaKind::Date, Payload::String(s)) => DateTime::parse_from_rfc3339(s)
      .map(|d| Payload::Date(d.with_timezone(&Utc)))
      .map_err(|e| SerializeError::InvalidDate {
        value: s.clone(),
        reason: e.to_string(),
      }),
    (MetaKind::Bytes, Payload::String(s)) => {
      hex::decode(s)
        .map(Payload::Bytes)
        .map_err(|e| SerializeError::InvalidBytes {
          path: path.to_string(),
          reason: e.to_string(),
        })
    }
    (MetaKind::NonFinite, Payload::String(s)) => {
      parse_non_finite(s)
        .map(Payload::Float)
        .ok_or_else(|| SerializeError::KindMismatch {
          kind,
          path: path.to_string(),
        })
    }
    _ => Err(SerializeError::KindMismatch {
      kind,
      path: path.to_string(),
    }),
  }
}

fn non_finite_label(f: f64) -> &'static str {
  if f.is_nan() {
    "NaN"
  } else if f.is_sign_positive() {
    "Infinity"
  } else {
    "-Infinity"
  }
}

fn parse_non_finite(s: &str) -> Option<f64> {
  match s {
    "NaN" => Some(f64::NAN),
    "Infinity" => Some(f64::INFINITY),
    "-Infinity" => Some(f64::NEG_INFINITY),
    _ => None,
  }
}
