//! Per-mode retry, freshness and hydration rules.
//!
//! The production and development tables are separate configuration data.
//! They are deliberately not derived from one another.

mod freshness;
mod hydration;
mod retry;

pub use freshness::{FreshnessPolicy, RefetchTrigger};
pub use hydration::HydrationPolicy;
pub use retry::{retry, AttemptLimits, Backoff, RetryPolicy};

use crate::config::EnvironmentMode;

/// Every policy the query client consults, resolved for one mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryDefaults {
  pub queries: RetryPolicy,
  pub mutations: RetryPolicy,
  pub freshness: FreshnessPolicy,
  pub hydration: HydrationPolicy,
}

impl QueryDefaults {
  pub fn for_mode(mode: EnvironmentMode) -> Self {
    Self {
      queries: RetryPolicy::queries(mode),
      mutations: RetryPolicy::mutations(mode),
      freshness: FreshnessPolicy::for_mode(mode),
      hydration: HydrationPolicy::for_mode(mode),
    }
  }
}
