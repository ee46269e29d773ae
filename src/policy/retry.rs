//! Retry eligibility and backoff for failed RPC attempts.
//!
//! Each policy is plain data: per-kind attempt limits plus a backoff curve.
//! Production and development tables are independent of each other.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EnvironmentMode;
use crate::error::{ErrorKind, RpcError};

/// Maximum number of retries allowed for each error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptLimits {
  pub network: u32,
  pub timeout: u32,
  pub rate_limited: u32,
  pub server_error: u32,
  pub client_error: u32,
  pub unclassified: u32,
  /// Refuse any error carrying a 4xx status, whatever its kind
  pub reject_client_status: bool,
}

impl AttemptLimits {
  pub fn max_attempts(&self, error: &RpcError) -> u32 {
    if self.reject_client_status && error.is_client_status() {
      return 0;
    }
    match error.kind {
      ErrorKind::Cancelled => 0,
      ErrorKind::Network => self.network,
      ErrorKind::Timeout => self.timeout,
      ErrorKind::RateLimited => self.rate_limited,
      ErrorKind::ServerError => self.server_error,
      ErrorKind::ClientError => self.client_error,
      ErrorKind::Unclassified => self.unclassified,
    }
  }
}

/// Exponential backoff: `base * 2^attempt` plus jitter, capped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
  pub base: Duration,
  pub ceiling: Duration,
  /// Largest jitter as a fraction of the computed delay
  pub jitter: f64,
}

impl Backoff {
  /// Delay before retry number `attempt`, given a jitter sample in `[0, 1)`.
  ///
  /// A rate-limited error carrying a retry-after hint waits exactly that long;
  /// without one it backs off like any other error.
  pub fn delay(&self, attempt: u32, error: &RpcError, sample: f64) -> Duration {
    if error.kind == ErrorKind::RateLimited {
      if let Some(after) = error.retry_after {
        return after;
      }
    }

    let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
    let ceiling_ms = u64::try_from(self.ceiling.as_millis()).unwrap_or(u64::MAX);
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    let exp_ms = base_ms.saturating_mul(factor);
    let jitter_ms = (exp_ms as f64 * self.jitter * sample.clamp(0.0, 1.0)) as u64;

    Duration::from_millis(exp_ms.saturating_add(jitter_ms).min(ceiling_ms))
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  pub limits: AttemptLimits,
  pub backoff: Backoff,
}

impl RetryPolicy {
  pub fn queries(mode: EnvironmentMode) -> Self {
    match mode {
      EnvironmentMode::Production => Self::production_queries(),
      EnvironmentMode::Development => Self::development_queries(),
    }
  }

  pub fn mutations(mode: EnvironmentMode) -> Self {
    match mode {
      EnvironmentMode::Production => Self::production_mutations(),
      EnvironmentMode::Development => Self::development_mutations(),
    }
  }

  pub fn production_queries() -> Self {
    Self {
      limits: AttemptLimits {
        network: 5,
        timeout: 2,
        rate_limited: 3,
        server_error: 2,
        client_error: 0,
        unclassified: 3,
        reject_client_status: false,
      },
      backoff: Backoff {
        base: Duration::from_millis(1000),
        ceiling: Duration::from_millis(30_000),
        jitter: 0.1,
      },
    }
  }

  pub fn production_mutations() -> Self {
    Self {
      limits: AttemptLimits {
        network: 1,
        timeout: 0,
        rate_limited: 0,
        server_error: 1,
        client_error: 0,
        unclassified: 0,
        reject_client_status: true,
      },
      backoff: Backoff {
        base: Duration::from_millis(2000),
        ceiling: Duration::from_millis(10_000),
        jitter: 0.1,
      },
    }
  }

  /// Flat rule: up to 3 retries unless the failure is a plain 4xx.
  pub fn development_queries() -> Self {
    Self {
      limits: AttemptLimits {
        network: 3,
        timeout: 3,
        rate_limited: 3,
        server_error: 3,
        client_error: 0,
        unclassified: 3,
        reject_client_status: false,
      },
      backoff: Backoff {
        base: Duration::from_millis(1000),
        ceiling: Duration::from_millis(30_000),
        jitter: 0.0,
      },
    }
  }

  /// One retry on anything that is not a 4xx.
  pub fn development_mutations() -> Self {
    Self {
      limits: AttemptLimits {
        network: 1,
        timeout: 1,
        rate_limited: 1,
        server_error: 1,
        client_error: 0,
        unclassified: 1,
        reject_client_status: true,
      },
      backoff: Backoff {
        base: Duration::from_millis(1000),
        ceiling: Duration::from_millis(10_000),
        jitter: 0.0,
      },
    }
  }

  /// Whether a failure at zero-based `attempt` should be retried.
  pub fn should_retry(&self, attempt: u32, error: &RpcError) -> bool {
    attempt < self.limits.max_attempts(error)
  }

  pub fn delay(&self, attempt: u32, error: &RpcError) -> Duration {
    self.backoff.delay(attempt, error, rand::random::<f64>())
  }
}

/// Run `op` until it succeeds or `policy` stops retrying.
///
/// The last error is returned once retries are exhausted. Cancelled errors
/// are returned immediately without computing a delay.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RpcError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, RpcError>>,
{
  let mut attempt = 0u32;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(error) => {
        if !policy.should_retry(attempt, &error) {
          if attempt > 0 {
            warn!(attempts = attempt + 1, %error, "giving up after retries");
          }
          return Err(error);
        }

        let delay = policy.delay(attempt, &error);
        debug!(
          attempt,
          kind = %error.kind,
          delay_ms = delay.as_millis() as u64,
          "retrying failed attempt"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
    }
  }
}
