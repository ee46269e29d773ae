//! Query keys and their canonical hashes.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::serializer::{self, Payload, SerializeError, Serialized};

/// An ordered list of tokens identifying a logical read.
///
/// Keys built from the same tokens hash identically regardless of the order
/// object fields were inserted in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryKey(Vec<Payload>);

impl QueryKey {
  pub fn new(parts: Vec<Payload>) -> Self {
    Self(parts)
  }

  /// Key for an RPC procedure call: `[[path...], {input, type: "query"}]`.
  pub fn rpc<S: Into<String>>(path: impl IntoIterator<Item = S>, input: Option<Payload>) -> Self {
    let mut options = vec![("type", Payload::from("query"))];
    if let Some(input) = input {
      options.push(("input", input));
    }
    Self(vec![Self::path_token(path), Payload::object(options)])
  }

  /// Prefix key matching every call under an RPC path.
  pub fn rpc_path<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
    Self(vec![Self::path_token(path)])
  }

  fn path_token<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Payload {
    Payload::array(path.into_iter().map(|s| Payload::String(s.into())))
  }

  /// Append a token.
  pub fn with(mut self, part: impl Into<Payload>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[Payload] {
    &self.0
  }

  /// Whether `prefix` matches the start of this key.
  ///
  /// Object tokens in the prefix match when every field they name matches;
  /// array tokens match element-wise as a prefix.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    prefix.0.len() <= self.0.len()
      && prefix
        .0
        .iter()
        .zip(&self.0)
        .all(|(part, full)| partial_match(full, part))
  }

  pub fn serialize(&self) -> Serialized {
    serializer::serialize(&Payload::Array(self.0.clone()))
  }

  pub fn from_serialized(serialized: Serialized) -> Result<Self, SerializeError> {
    match serializer::deserialize(serialized.json, &serialized.meta)? {
      Payload::Array(parts) => Ok(Self(parts)),
      _ => Err(SerializeError::NotAKey),
    }
  }

  /// Canonical `{json, meta}` text for this key.
  pub fn canonical(&self) -> String {
    self.serialize().to_value().to_string()
  }

  /// Hex SHA-256 of the canonical form, used as the cache map key.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.serialize().json)
  }
}

impl From<Vec<Payload>> for QueryKey {
  fn from(parts: Vec<Payload>) -> Self {
    Self(parts)
  }
}

fn partial_match(full: &Payload, part: &Payload) -> bool {
  match (full, part) {
    (Payload::Object(full), Payload::Object(part)) => part.iter().all(|(name, value)| {
      full
        .get(name)
        .is_some_and(|actual| partial_match(actual, value))
    }),
    (Payload::Array(full), Payload::Array(part)) => {
      part.len() <= full.len() && part.iter().zip(full).all(|(p, f)| partial_match(f, p))
    }
    _ => full == part,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::serializer::tests::arb_payload;
  use chrono::{TimeZone, Utc};
  use proptest::prelude::*;
  use serde_json::json;

  #[test]
  fn test_field_order_does_not_change_hash() {
    let a: serde_json::Value = serde_json::from_str(r#"{"id": 7, "tab": "posts"}"#).unwrap();
    let b: serde_json::Value = serde_json::from_str(r#"{"tab": "posts", "id": 7}"#).unwrap();

    let k1 = QueryKey::new(vec!["user".into(), "profile".into(), a.into()]);
    let k2 = QueryKey::new(vec!["user".into(), "profile".into(), b.into()]);

    assert_eq!(k1.hash(), k2.hash());
    assert_eq!(k1.canonical(), k2.canonical());
  }

  #[test]
  fn test_different_keys_do_not_collide() {
    let base = QueryKey::new(vec!["user".into()]);
    let keys = [
      base.clone().with(1),
      base.clone().with("1"),
      base.clone().with(1.5),
      base.clone().with(Payload::Null),
      base.clone().with(Payload::Undefined),
      base.clone().with(Payload::object([("id", Payload::from(1))])),
      base.clone().with(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
      base.clone().with("2024-01-01T00:00:00Z"),
    ];

    let hashes: std::collections::HashSet<_> = keys.iter().map(QueryKey::hash).collect();
    assert_eq!(hashes.len(), keys.len());
  }

  #[test]
  fn test_hash_is_fixed_length_hex() {
    let hash = QueryKey::new(vec!["a".into()]).hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_rpc_key_shape() {
    let key = QueryKey::rpc(["user", "profile"], Some(json!({"id": 7}).into()));
    assert_eq!(
      key.serialize().json,
      json!([["user", "profile"], {"input": {"id": 7}, "type": "query"}])
    );
  }

  #[test]
  fn test_rpc_path_prefix_matches() {
    let key = QueryKey::rpc(["user", "profile"], Some(json!({"id": 7}).into()));

    assert!(key.starts_with(&QueryKey::rpc_path(["user"])));
    assert!(key.starts_with(&QueryKey::rpc_path(["user", "profile"])));
    assert!(!key.starts_with(&QueryKey::rpc_path(["post"])));
    assert!(key.starts_with(&QueryKey::new(vec![
      Payload::array(["user".into()]),
      Payload::object([("input", json!({"id": 7}).into())]),
    ])));
    assert!(!key.starts_with(&QueryKey::new(vec![
      Payload::array(["user".into()]),
      Payload::object([("input", json!({"id": 8}).into())]),
    ])));
  }

  #[test]
  fn test_serialized_key_round_trip() {
    let key = QueryKey::new(vec![
      "user".into(),
      Payload::object([
        ("since", Utc.with_ymd_and_hms(2023, 6, 1, 8, 0, 0).unwrap().into()),
        ("cursor", Payload::Undefined),
      ]),
    ]);

    let restored = QueryKey::from_serialized(key.serialize()).unwrap();
    assert_eq!(restored, key);
    assert_eq!(restored.hash(), key.hash());
  }

  #[test]
  fn test_non_array_is_not_a_key() {
    let serialized = crate::serializer::serialize(&Payload::from("user"));
    assert_eq!(
      QueryKey::from_serialized(serialized),
      Err(SerializeError::NotAKey)
    );
  }

  proptest! {
    #[test]
    fn prop_hash_ignores_field_insertion_order(
      fields in proptest::collection::vec(("[a-z]{1,4}", arb_payload()), 0..6)
    ) {
      let forward = Payload::object(fields.iter().cloned());
      let backward = Payload::object(fields.iter().rev().cloned());
      // Later duplicates win in `collect`, so drop them to compare like for like.
      prop_assume!({
        let mut names: Vec<_> = fields.iter().map(|(k, _)| k.clone()).collect();
        names.sort();
        names.dedup();
        names.len() == fields.len()
      });

      let k1 = QueryKey::new(vec!["q".into(), forward]);
      let k2 = QueryKey::new(vec!["q".into(), backward]);
      prop_assert_eq!(k1.hash(), k2.hash());
    }
  }
}
