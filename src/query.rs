//! Observer handle for one query key.
//!
//! A `QueryObserver` is what a screen or command holds while it cares about a
//! key. It keeps the entry alive in the [`QueryClient`] (eviction only starts
//! once every observer is dropped), asks the freshness policy whether lifecycle
//! events should trigger a fetch, and exposes the result as a [`QueryState`].
//!
//! # Example
//!
//! ```ignore
//! let transport = link.clone();
//! let mut observer = QueryObserver::new(client.clone(), key, move || {
//!   transport.call(request.clone())
//! });
//!
//! // When the view appears
//! observer.mount();
//!
//! // In event loop tick
//! if observer.poll() {
//!   // State changed, trigger re-render
//! }
//!
//! // In render
//! match observer.state() {
//!   QueryState::Loading => render_spinner(),
//!   QueryState::Success(data) => render_data(data),
//!   QueryState::Error(e) => render_error(e),
//!   QueryState::Idle => {}
//! }
//! ```

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{QueryClient, QueryResult, QueryStatus};
use crate::error::RpcError;
use crate::key::QueryKey;
use crate::policy::RefetchTrigger;
use crate::serializer::Payload;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(RpcError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&RpcError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Payload, RpcError>> + Send + Sync>;

/// Live subscription to one cache entry.
pub struct QueryObserver {
  client: QueryClient,
  key: QueryKey,
  fetcher: Fetcher,
  state: QueryState<Arc<Payload>>,
  /// State to fall back to if the running fetch is cancelled
  previous: Option<QueryState<Arc<Payload>>>,
  receiver: Option<mpsc::UnboundedReceiver<Result<QueryResult, RpcError>>>,
}

impl QueryObserver {
  /// Subscribe to `key`. No fetch is started until a lifecycle event asks
  /// for one; the initial state reflects whatever the cache already holds.
  pub fn new<F, Fut>(client: QueryClient, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, RpcError>> + Send + 'static,
  {
    client.subscribe(&key);
    let mut observer = Self {
      client,
      key,
      fetcher: Arc::new(move || fetcher().boxed()),
      state: QueryState::Idle,
      previous: None,
      receiver: None,
    };
    observer.sync_from_cache();
    observer
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<Arc<Payload>> {
    &self.state
  }

  pub fn data(&self) -> Option<&Arc<Payload>> {
    self.state.data()
  }

  pub fn error(&self) -> Option<&RpcError> {
    self.state.error()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// The observer became visible. Returns whether a fetch was started.
  pub fn mount(&mut self) -> bool {
    self.on_trigger(RefetchTrigger::Mount)
  }

  pub fn on_window_focus(&mut self) -> bool {
    self.on_trigger(RefetchTrigger::WindowFocus)
  }

  pub fn on_reconnect(&mut self) -> bool {
    self.on_trigger(RefetchTrigger::Reconnect)
  }

  fn on_trigger(&mut self, trigger: RefetchTrigger) -> bool {
    if self.state.is_loading() {
      return false;
    }
    if !self.client.should_refetch(&self.key, trigger) {
      self.sync_from_cache();
      return false;
    }
    debug!(key = %self.key, ?trigger, "lifecycle event triggered fetch");
    self.start(false);
    true
  }

  /// Force a new attempt, superseding any in flight.
  pub fn refetch(&mut self) {
    self.start(true);
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    let outcome = match receiver.try_recv() {
      Ok(outcome) => outcome,
      Err(mpsc::error::TryRecvError::Empty) => return false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        Err(RpcError::cancelled("fetch task ended without a result"))
      }
    };
    self.receiver = None;

    let previous = self.previous.take().unwrap_or(QueryState::Idle);
    self.state = match outcome {
      Ok(result) => QueryState::Success(result.data),
      Err(error) if error.is_cancelled() => previous,
      Err(error) => QueryState::Error(error),
    };
    true
  }

  fn start(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if !self.state.is_loading() {
      self.previous = Some(std::mem::replace(&mut self.state, QueryState::Loading));
    }

    let client = self.client.clone();
    let key = self.key.clone();
    let fetcher = self.fetcher.clone();
    tokio::spawn(async move {
      let fetch = move || fetcher();
      let result = if force {
        client.refetch_query(&key, fetch).await
      } else {
        client.fetch_query(&key, fetch).await
      };
      // Receiver may have been dropped
      let _ = tx.send(result);
    });
  }

  fn sync_from_cache(&mut self) {
    let Some(entry) = self.client.get_entry(&self.key) else {
      return;
    };
    self.state = match (entry.status, entry.data, entry.error) {
      (_, Some(data), _) => QueryState::Success(data),
      (QueryStatus::Error, None, Some(error)) => QueryState::Error(error),
      _ => QueryState::Idle,
    };
  }
}

impl Drop for QueryObserver {
  fn drop(&mut self) {
    self.client.unsubscribe(&self.key);
  }
}

impl std::fmt::Debug for QueryObserver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ManualClock;
  use crate::config::EnvironmentMode;
  use chrono::Utc;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn key() -> QueryKey {
    QueryKey::rpc(["todo", "list"], None)
  }

  fn counting(calls: &Arc<AtomicU32>) -> impl Fn() -> BoxFuture<'static, Result<Payload, RpcError>> + Send + Sync + 'static {
    let calls = calls.clone();
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move { Ok(Payload::from(n)) }.boxed()
    }
  }

  async fn settle(observer: &mut QueryObserver) -> bool {
    tokio::time::sleep(Duration::from_millis(10)).await;
    observer.poll()
  }

  #[tokio::test]
  async fn test_mount_fetches_empty_entry() {
    let client = QueryClient::new(EnvironmentMode::Production);
    let calls = Arc::new(AtomicU32::new(0));
    let mut observer = QueryObserver::new(client, key(), counting(&calls));

    assert!(matches!(observer.state(), QueryState::Idle));
    assert!(observer.mount());
    assert!(observer.is_loading());

    assert!(settle(&mut observer).await);
    assert_eq!(observer.data().map(|d| d.as_ref()), Some(&Payload::from(1u32)));
  }

  #[tokio::test]
  async fn test_mount_serves_fresh_cache() {
    let client = QueryClient::new(EnvironmentMode::Development);
    client.set_query_data(&key(), Payload::from("cached"));
    let calls = Arc::new(AtomicU32::new(0));

    let mut observer = QueryObserver::new(client, key(), counting(&calls));
    assert!(observer.state().is_success());
    assert!(!observer.mount());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_window_focus_follows_mode() {
    for (mode, expected) in [
      (EnvironmentMode::Production, false),
      (EnvironmentMode::Development, true),
    ] {
      let clock = Arc::new(ManualClock::new(Utc::now()));
      let client = QueryClient::with_clock(mode, clock.clone());
      client.set_query_data(&key(), Payload::from("cached"));
      clock.advance(chrono::Duration::minutes(10));

      let calls = Arc::new(AtomicU32::new(0));
      let mut observer = QueryObserver::new(client, key(), counting(&calls));
      assert_eq!(observer.on_window_focus(), expected);
      if !expected {
        assert!(observer.on_reconnect());
      }
    }
  }

  #[tokio::test]
  async fn test_error_surfaces_in_state() {
    let client = QueryClient::new(EnvironmentMode::Production);
    let mut observer = QueryObserver::new(client, key(), || async {
      Err::<Payload, _>(RpcError::from_status(403, "forbidden"))
    });

    observer.mount();
    assert!(settle(&mut observer).await);
    assert_eq!(observer.error().and_then(|e| e.status), Some(403));
  }

  #[tokio::test]
  async fn test_cancel_restores_previous_state() {
    let client = QueryClient::new(EnvironmentMode::Production);
    client.set_query_data(&key(), Payload::from("kept"));
    let mut observer = QueryObserver::new(client.clone(), key(), || async {
      futures::future::pending::<()>().await;
      Ok::<_, RpcError>(Payload::Null)
    });

    observer.refetch();
    while !client.is_fetching(&key()) {
      tokio::task::yield_now().await;
    }
    client.cancel_query(&key());

    assert!(settle(&mut observer).await);
    assert_eq!(observer.data().map(|d| d.as_ref()), Some(&Payload::from("kept")));
  }

  #[tokio::test]
  async fn test_drop_starts_eviction_countdown() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let client = QueryClient::with_clock(EnvironmentMode::Development, clock.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(client.clone(), key(), counting(&calls));
    clock.advance(chrono::Duration::hours(1));
    assert_eq!(client.collect_garbage(), 0);

    drop(observer);
    clock.advance(chrono::Duration::minutes(5));
    assert_eq!(client.collect_garbage(), 1);
  }
}
