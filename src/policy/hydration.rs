//! Which cache entries may cross an execution boundary.

use crate::cache::{CacheEntry, QueryStatus};
use crate::config::EnvironmentMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrationPolicy {
  /// Transfer entries that only hold an error
  pub transfer_errors: bool,
}

impl HydrationPolicy {
  pub fn for_mode(mode: EnvironmentMode) -> Self {
    Self {
      transfer_errors: !mode.is_production(),
    }
  }

  /// Pending entries and entries with data always transfer. Production
  /// keeps error-only entries on the side that produced them.
  pub fn should_dehydrate(&self, entry: &CacheEntry) -> bool {
    entry.status == QueryStatus::Pending
      || entry.data.is_some()
      || entry.error.is_none()
      || self.transfer_errors
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RpcError;
  use crate::policy::FreshnessPolicy;
  use crate::serializer::Payload;
  use chrono::Utc;
  use std::sync::Arc;

  fn failed() -> CacheEntry {
    let mut entry = CacheEntry::pending();
    entry.record_error(RpcError::from_status(500, "boom"), Utc::now());
    entry
  }

  #[test]
  fn test_pending_transfers() {
    for mode in [EnvironmentMode::Production, EnvironmentMode::Development] {
      assert!(HydrationPolicy::for_mode(mode).should_dehydrate(&CacheEntry::pending()));
    }
  }

  #[test]
  fn test_data_transfers_even_with_error() {
    let freshness = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    let mut entry = CacheEntry::pending();
    entry.record_success(Arc::new(Payload::Undefined), Utc::now(), &freshness);
    entry.record_error(RpcError::network("down"), Utc::now());

    assert!(HydrationPolicy::for_mode(EnvironmentMode::Production).should_dehydrate(&entry));
  }

  #[test]
  fn test_error_only_entry_depends_on_mode() {
    let entry = failed();
    assert!(!HydrationPolicy::for_mode(EnvironmentMode::Production).should_dehydrate(&entry));
    assert!(HydrationPolicy::for_mode(EnvironmentMode::Development).should_dehydrate(&entry));
  }
}
