//! Serializable snapshot of a query cache.
//!
//! A [`DehydratedState`] carries cache entries from one execution context to
//! another (an earlier process run, a server render) without refetching.
//! Keys and data go through the payload serializer so dates, bytes and
//! `undefined` arrive intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::entry::{CacheEntry, QueryStatus};
use crate::error::RpcError;
use crate::key::QueryKey;
use crate::policy::FreshnessPolicy;
use crate::serializer::{self, SerializeError, Serialized};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
  pub queries: Vec<DehydratedQuery>,
}

impl DehydratedState {
  pub fn is_empty(&self) -> bool {
    self.queries.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
  pub query_hash: String,
  pub query_key: Serialized,
  pub state: DehydratedEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedEntry {
  pub status: QueryStatus,
  pub data: Option<Serialized>,
  pub error: Option<RpcError>,
  pub data_updated_at: Option<DateTime<Utc>>,
  pub error_updated_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub is_invalidated: bool,
}

impl DehydratedQuery {
  pub fn capture(key: &QueryKey, entry: &CacheEntry) -> Self {
    Self {
      query_hash: key.hash(),
      query_key: key.serialize(),
      state: DehydratedEntry {
        status: entry.status,
        data: entry.data.as_deref().map(serializer::serialize),
        error: entry.error.clone(),
        data_updated_at: entry.data_updated_at,
        error_updated_at: entry.error_updated_at,
        is_invalidated: entry.is_invalidated,
      },
    }
  }

  /// Rebuild the key and entry. Staleness is recomputed from the original
  /// fetch time, so a snapshot does not make old data fresh again.
  pub fn restore(self, freshness: &FreshnessPolicy) -> Result<(QueryKey, CacheEntry), SerializeError> {
    let key = QueryKey::from_serialized(self.query_key)?;
    let state = self.state;

    let data = state
      .data
      .map(|s| serializer::deserialize(s.json, &s.meta))
      .transpose()?
      .map(Arc::new);

    let stale_at = match (&data, state.data_updated_at) {
      (Some(_), Some(at)) => Some(at + freshness.stale_after),
      _ => None,
    };

    let entry = CacheEntry {
      status: state.status,
      data,
      error: state.error,
      data_updated_at: state.data_updated_at,
      error_updated_at: state.error_updated_at,
      stale_at,
      gc_at: None,
      is_invalidated: state.is_invalidated,
    };

    Ok((key, entry))
  }
}
