//! Cache entries and the results handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RpcError;
use crate::policy::FreshnessPolicy;
use crate::serializer::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  /// No attempt has settled yet
  Pending,
  Success,
  Error,
}

impl QueryStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      QueryStatus::Pending => "pending",
      QueryStatus::Success => "success",
      QueryStatus::Error => "error",
    }
  }
}

/// Last known state of one query key.
///
/// Entries change only when an attempt settles, so observers never see a
/// half-applied update.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub status: QueryStatus,
  pub data: Option<Arc<Payload>>,
  pub error: Option<RpcError>,
  /// When `data` was fetched
  pub data_updated_at: Option<DateTime<Utc>>,
  pub error_updated_at: Option<DateTime<Utc>>,
  /// Staleness deadline, never earlier than `data_updated_at`
  pub stale_at: Option<DateTime<Utc>>,
  /// Eviction deadline once unobserved, never earlier than `stale_at`
  pub gc_at: Option<DateTime<Utc>>,
  pub is_invalidated: bool,
}

impl Default for CacheEntry {
  fn default() -> Self {
    Self::pending()
  }
}

impl CacheEntry {
  pub fn pending() -> Self {
    Self {
      status: QueryStatus::Pending,
      data: None,
      error: None,
      data_updated_at: None,
      error_updated_at: None,
      stale_at: None,
      gc_at: None,
      is_invalidated: false,
    }
  }

  /// Check if the data is stale at `now`.
  ///
  /// Entries without data, and invalidated entries, are always stale.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    if self.data.is_none() || self.is_invalidated {
      return true;
    }
    self.stale_at.map_or(true, |at| now >= at)
  }

  /// The data, if it is still fresh at `now`.
  pub fn fresh_data(&self, now: DateTime<Utc>) -> Option<Arc<Payload>> {
    if self.is_stale(now) {
      None
    } else {
      self.data.clone()
    }
  }

  pub(crate) fn record_success(
    &mut self,
    data: Arc<Payload>,
    now: DateTime<Utc>,
    freshness: &FreshnessPolicy,
  ) {
    let stale_at = now + freshness.stale_after;
    self.status = QueryStatus::Success;
    self.data = Some(data);
    self.error = None;
    self.data_updated_at = Some(now);
    self.stale_at = Some(stale_at);
    self.gc_at = self.gc_at.map(|gc| gc.max(stale_at));
    self.is_invalidated = false;
  }

  /// Record a failure. Previously fetched data is kept.
  pub(crate) fn record_error(&mut self, error: RpcError, now: DateTime<Utc>) {
    self.status = QueryStatus::Error;
    self.error = Some(error);
    self.error_updated_at = Some(now);
  }

  pub(crate) fn schedule_gc(&mut self, now: DateTime<Utc>, freshness: &FreshnessPolicy) {
    let at = now + freshness.evict_after;
    self.gc_at = Some(match self.stale_at {
      Some(stale_at) => at.max(stale_at),
      None => at,
    });
  }

  pub(crate) fn cancel_gc(&mut self) {
    self.gc_at = None;
  }
}

/// Result of a query fetch, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct QueryResult {
  pub data: Arc<Payload>,
  pub source: CacheSource,
  /// When the data was fetched (if from cache)
  pub updated_at: Option<DateTime<Utc>>,
}

impl QueryResult {
  pub fn from_network(data: Arc<Payload>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      updated_at: None,
    }
  }

  pub fn from_cache(data: Arc<Payload>, updated_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      updated_at,
    }
  }
}

/// Indicates where query data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Settled attempt, issued by this caller or joined in flight
  Network,
  /// Fresh cached data, no attempt made
  Cache,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::EnvironmentMode;
  use chrono::{Duration, TimeZone};

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
  }

  #[test]
  fn test_deadlines_are_ordered() {
    for mode in [EnvironmentMode::Production, EnvironmentMode::Development] {
      let freshness = FreshnessPolicy::for_mode(mode);
      let mut entry = CacheEntry::pending();
      entry.record_success(Arc::new(Payload::from(1)), t0(), &freshness);
      entry.schedule_gc(t0(), &freshness);

      let fetched = entry.data_updated_at.unwrap();
      let stale_at = entry.stale_at.unwrap();
      let gc_at = entry.gc_at.unwrap();
      assert!(stale_at >= fetched);
      assert!(gc_at >= stale_at);
    }
  }

  #[test]
  fn test_gc_never_precedes_staleness() {
    let freshness = FreshnessPolicy {
      stale_after: Duration::minutes(10),
      evict_after: Duration::minutes(1),
      ..FreshnessPolicy::for_mode(EnvironmentMode::Production)
    };
    let mut entry = CacheEntry::pending();
    entry.schedule_gc(t0(), &freshness);
    entry.record_success(Arc::new(Payload::Null), t0(), &freshness);

    assert_eq!(entry.gc_at, entry.stale_at);
  }

  #[test]
  fn test_staleness() {
    let freshness = FreshnessPolicy::for_mode(EnvironmentMode::Development);
    let mut entry = CacheEntry::pending();
    assert!(entry.is_stale(t0()));

    entry.record_success(Arc::new(Payload::from("x")), t0(), &freshness);
    assert!(!entry.is_stale(t0() + Duration::seconds(29)));
    assert!(entry.is_stale(t0() + Duration::seconds(30)));

    entry.is_invalidated = true;
    assert!(entry.is_stale(t0()));
    assert!(entry.fresh_data(t0()).is_none());
  }

  #[test]
  fn test_error_keeps_data() {
    let freshness = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    let mut entry = CacheEntry::pending();
    entry.record_success(Arc::new(Payload::from(5)), t0(), &freshness);
    entry.record_error(RpcError::network("down"), t0() + Duration::seconds(1));

    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.data.as_deref(), Some(&Payload::from(5)));
    assert_eq!(entry.data_updated_at, Some(t0()));
  }
}
