//! How long results stay fresh, when they are evicted, and which events
//! trigger a background refetch.

use chrono::{DateTime, Duration, Utc};

use crate::cache::CacheEntry;
use crate::config::EnvironmentMode;

/// Events that may cause an observed query to refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchTrigger {
  /// An observer attached to the key
  Mount,
  /// The application regained focus
  WindowFocus,
  /// Network connectivity came back
  Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
  pub stale_after: Duration,
  pub evict_after: Duration,
  pub refetch_on_mount: bool,
  pub refetch_on_window_focus: bool,
  pub refetch_on_reconnect: bool,
}

impl FreshnessPolicy {
  pub fn for_mode(mode: EnvironmentMode) -> Self {
    match mode {
      // Cached data is authoritative until invalidated.
      EnvironmentMode::Production => Self {
        stale_after: Duration::minutes(5),
        evict_after: Duration::minutes(30),
        refetch_on_mount: false,
        refetch_on_window_focus: false,
        refetch_on_reconnect: true,
      },
      EnvironmentMode::Development => Self {
        stale_after: Duration::seconds(30),
        evict_after: Duration::minutes(5),
        refetch_on_mount: true,
        refetch_on_window_focus: true,
        refetch_on_reconnect: true,
      },
    }
  }

  /// `(stale_after, evict_after)`
  pub fn windows(&self) -> (Duration, Duration) {
    (self.stale_after, self.evict_after)
  }

  pub fn allows(&self, trigger: RefetchTrigger) -> bool {
    match trigger {
      RefetchTrigger::Mount => self.refetch_on_mount,
      RefetchTrigger::WindowFocus => self.refetch_on_window_focus,
      RefetchTrigger::Reconnect => self.refetch_on_reconnect,
    }
  }

  /// Whether `trigger` should cause a fetch for `entry` at `now`.
  pub fn should_refetch(&self, trigger: RefetchTrigger, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    if entry.data.is_none() {
      return trigger == RefetchTrigger::Mount;
    }
    if entry.is_invalidated {
      return true;
    }
    self.allows(trigger) && entry.is_stale(now)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::serializer::Payload;
  use chrono::TimeZone;
  use std::sync::Arc;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
  }

  fn cached(policy: &FreshnessPolicy) -> CacheEntry {
    let mut entry = CacheEntry::pending();
    entry.record_success(Arc::new(Payload::from("cached")), t0(), policy);
    entry
  }

  #[test]
  fn test_windows() {
    let prod = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    assert_eq!(prod.windows(), (Duration::minutes(5), Duration::minutes(30)));

    let dev = FreshnessPolicy::for_mode(EnvironmentMode::Development);
    assert_eq!(dev.windows(), (Duration::seconds(30), Duration::minutes(5)));
  }

  #[test]
  fn test_production_never_refetches_young_entry_on_mount() {
    let policy = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    let entry = cached(&policy);

    for secs in [0, 31, 120, 299] {
      let now = t0() + Duration::seconds(secs);
      assert!(!policy.should_refetch(RefetchTrigger::Mount, &entry, now));
      assert!(!policy.should_refetch(RefetchTrigger::WindowFocus, &entry, now));
    }
  }

  #[test]
  fn test_production_ignores_focus_even_when_stale() {
    let policy = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    let entry = cached(&policy);
    let later = t0() + Duration::minutes(10);

    assert!(!policy.should_refetch(RefetchTrigger::WindowFocus, &entry, later));
    assert!(!policy.should_refetch(RefetchTrigger::Mount, &entry, later));
    assert!(policy.should_refetch(RefetchTrigger::Reconnect, &entry, later));
  }

  #[test]
  fn test_development_refetches_after_thirty_seconds() {
    let policy = FreshnessPolicy::for_mode(EnvironmentMode::Development);
    let entry = cached(&policy);

    assert!(!policy.should_refetch(RefetchTrigger::Mount, &entry, t0() + Duration::seconds(10)));
    assert!(policy.should_refetch(RefetchTrigger::Mount, &entry, t0() + Duration::seconds(31)));
    assert!(policy.should_refetch(
      RefetchTrigger::WindowFocus,
      &entry,
      t0() + Duration::seconds(31)
    ));
  }

  #[test]
  fn test_empty_entry_fetches_on_mount_only() {
    let policy = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    let entry = CacheEntry::pending();
    assert!(policy.should_refetch(RefetchTrigger::Mount, &entry, t0()));
    assert!(!policy.should_refetch(RefetchTrigger::Reconnect, &entry, t0()));
  }

  #[test]
  fn test_invalidated_entry_refetches_in_production() {
    let policy = FreshnessPolicy::for_mode(EnvironmentMode::Production);
    let mut entry = cached(&policy);
    entry.is_invalidated = true;
    assert!(policy.should_refetch(RefetchTrigger::Mount, &entry, t0()));
  }
}
