//! The query client: one process-wide cache of query results.
//!
//! A `QueryClient` is constructed once at startup and cloned into every
//! consumer. It owns the map from key hash to cache entry and enforces:
//!
//! - at most one in-flight attempt per key (later requesters join it)
//! - settlement in issue order (a result older than the last settled one is
//!   dropped, whatever order the network returned them in)
//! - cancelled attempts never touch the entry
//! - unobserved entries are evicted once their GC deadline passes
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::new(EnvironmentMode::Production);
//! let key = QueryKey::rpc(["user", "profile"], Some(input));
//! let result = client
//!   .fetch_query(&key, move || transport.call(request.clone()))
//!   .await?;
//! ```

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, QueryResult};
use super::hydration::{DehydratedQuery, DehydratedState};
use crate::config::EnvironmentMode;
use crate::error::RpcError;
use crate::key::QueryKey;
use crate::policy::{retry, QueryDefaults, RefetchTrigger};
use crate::serializer::{Payload, SerializeError};

type Settlement = Result<Arc<Payload>, RpcError>;
type SharedAttempt = Shared<BoxFuture<'static, Settlement>>;

struct InFlight {
  seq: u64,
  attempt: SharedAttempt,
  abort: AbortHandle,
}

struct Slot {
  key: QueryKey,
  entry: CacheEntry,
  in_flight: Option<InFlight>,
  observers: usize,
  /// Issue sequence of the attempt that last wrote the entry
  settled_seq: u64,
}

impl Slot {
  fn new(key: QueryKey, floor_seq: u64) -> Self {
    Self {
      key,
      entry: CacheEntry::pending(),
      in_flight: None,
      observers: 0,
      settled_seq: floor_seq,
    }
  }
}

struct Inner {
  mode: EnvironmentMode,
  defaults: QueryDefaults,
  clock: Arc<dyn Clock>,
  slots: Mutex<HashMap<String, Slot>>,
  next_seq: AtomicU64,
}

impl Inner {
  fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn issue_seq(&self) -> u64 {
    self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
  }

  fn current_seq(&self) -> u64 {
    self.next_seq.load(Ordering::Relaxed)
  }

  fn slot_mut<'a>(&self, slots: &'a mut HashMap<String, Slot>, key: &QueryKey) -> &'a mut Slot {
    let floor = self.current_seq();
    let now = self.clock.now();
    let freshness = self.defaults.freshness;
    slots.entry(key.hash()).or_insert_with(|| {
      let mut slot = Slot::new(key.clone(), floor);
      slot.entry.schedule_gc(now, &freshness);
      slot
    })
  }

  /// Apply a finished attempt to its entry.
  fn settle(&self, hash: &str, seq: u64, outcome: &Settlement) {
    let now = self.clock.now();
    let mut slots = self.slots();
    let Some(slot) = slots.get_mut(hash) else {
      debug!(key = hash, seq, "attempt settled after its entry was removed");
      return;
    };

    if slot.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
      slot.in_flight = None;
    }

    if let Err(error) = outcome {
      if error.is_cancelled() {
        debug!(key = hash, seq, "attempt cancelled, entry left untouched");
        return;
      }
    }

    if seq < slot.settled_seq {
      debug!(
        key = hash,
        seq,
        settled = slot.settled_seq,
        "discarding superseded result"
      );
      return;
    }
    slot.settled_seq = seq;

    let freshness = self.defaults.freshness;
    match outcome {
      Ok(data) => slot.entry.record_success(Arc::clone(data), now, &freshness),
      Err(error) => slot.entry.record_error(error.clone(), now),
    }
    if slot.observers == 0 {
      slot.entry.schedule_gc(now, &freshness);
    }
  }
}

/// Process-wide query cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
}

impl QueryClient {
  pub fn new(mode: EnvironmentMode) -> Self {
    Self::with_clock(mode, Arc::new(SystemClock))
  }

  pub fn with_clock(mode: EnvironmentMode, clock: Arc<dyn Clock>) -> Self {
    info!(?mode, "query client created");
    Self {
      inner: Arc::new(Inner {
        mode,
        defaults: QueryDefaults::for_mode(mode),
        clock,
        slots: Mutex::new(HashMap::new()),
        next_seq: AtomicU64::new(0),
      }),
    }
  }

  pub fn mode(&self) -> EnvironmentMode {
    self.inner.mode
  }

  pub fn defaults(&self) -> &QueryDefaults {
    &self.inner.defaults
  }

  fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  /// Return fresh data for `key`, fetching it if needed.
  ///
  /// Fresh cached data is returned without calling `fetcher`. Otherwise the
  /// caller joins the attempt already in flight for the key, or a new one is
  /// dispatched. Failed attempts are retried per the query retry policy.
  pub async fn fetch_query<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<QueryResult, RpcError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, RpcError>> + Send + 'static,
  {
    let now = self.now();
    let attempt = {
      let mut slots = self.inner.slots();
      let slot = self.inner.slot_mut(&mut slots, key);

      if let Some(data) = slot.entry.fresh_data(now) {
        return Ok(QueryResult::from_cache(data, slot.entry.data_updated_at));
      }

      let joined = slot.in_flight.as_ref().map(|in_flight| {
        debug!(key = %key, seq = in_flight.seq, "joining in-flight attempt");
        in_flight.attempt.clone()
      });
      match joined {
        Some(attempt) => attempt,
        None => self.dispatch(key, slot, fetcher),
      }
    };

    attempt.await.map(QueryResult::from_network)
  }

  /// Issue a new attempt for `key` even if one is already in flight.
  ///
  /// The older attempt keeps running for whoever awaits it, but its result
  /// is not written once this one has settled.
  pub async fn refetch_query<F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<QueryResult, RpcError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, RpcError>> + Send + 'static,
  {
    let attempt = {
      let mut slots = self.inner.slots();
      let slot = self.inner.slot_mut(&mut slots, key);
      self.dispatch(key, slot, fetcher)
    };

    attempt.await.map(QueryResult::from_network)
  }

  /// Start an attempt on a spawned task so it runs to completion even if
  /// every requester goes away.
  fn dispatch<F, Fut>(&self, key: &QueryKey, slot: &mut Slot, fetcher: F) -> SharedAttempt
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, RpcError>> + Send + 'static,
  {
    let seq = self.inner.issue_seq();
    let policy = self.inner.defaults.queries;
    let inner: Weak<Inner> = Arc::downgrade(&self.inner);
    let hash = key.hash();
    let (abort, registration) = AbortHandle::new_pair();

    let run = async move {
      let outcome = retry(&policy, || fetcher()).await.map(Arc::new);
      if let Some(inner) = inner.upgrade() {
        inner.settle(&hash, seq, &outcome);
      }
      outcome
    };

    let attempt = Abortable::new(run, registration)
      .map(|result| result.unwrap_or_else(|_| Err(RpcError::cancelled("query was cancelled"))))
      .boxed()
      .shared();

    debug!(key = %key, seq, "dispatching query attempt");
    slot.in_flight = Some(InFlight {
      seq,
      attempt: attempt.clone(),
      abort,
    });
    tokio::spawn(attempt.clone());
    attempt
  }

  /// Run a mutation through the mutation retry policy. Nothing is cached.
  pub async fn execute_mutation<F, Fut>(&self, fetcher: F) -> Result<Payload, RpcError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Payload, RpcError>>,
  {
    retry(&self.inner.defaults.mutations, fetcher).await
  }

  /// Abort the attempt in flight for `key`.
  ///
  /// Waiters receive a cancelled error; the entry keeps its previous state.
  pub fn cancel_query(&self, key: &QueryKey) -> bool {
    let mut slots = self.inner.slots();
    let Some(in_flight) = slots.get_mut(&key.hash()).and_then(|s| s.in_flight.take()) else {
      return false;
    };
    in_flight.abort.abort();
    debug!(key = %key, seq = in_flight.seq, "cancelled in-flight attempt");
    true
  }

  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self
      .inner
      .slots()
      .get(&key.hash())
      .is_some_and(|s| s.in_flight.is_some())
  }

  pub fn get_entry(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.inner.slots().get(&key.hash()).map(|s| s.entry.clone())
  }

  pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<Payload>> {
    self
      .inner
      .slots()
      .get(&key.hash())
      .and_then(|s| s.entry.data.clone())
  }

  /// Write data for `key` directly, as if an attempt had just settled.
  ///
  /// Attempts issued before this call can no longer overwrite it.
  pub fn set_query_data(&self, key: &QueryKey, data: Payload) {
    let now = self.now();
    let seq = self.inner.issue_seq();
    let freshness = self.inner.defaults.freshness;
    let mut slots = self.inner.slots();
    let slot = self.inner.slot_mut(&mut slots, key);
    slot.settled_seq = seq;
    slot.entry.record_success(Arc::new(data), now, &freshness);
  }

  /// Mark every entry whose key starts with `prefix` as stale.
  pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
    let mut count = 0;
    for slot in self.inner.slots().values_mut() {
      if slot.key.starts_with(prefix) {
        slot.entry.is_invalidated = true;
        count += 1;
      }
    }
    debug!(prefix = %prefix, count, "invalidated queries");
    count
  }

  /// Whether `trigger` should cause a fetch for `key` right now.
  pub fn should_refetch(&self, key: &QueryKey, trigger: RefetchTrigger) -> bool {
    let now = self.now();
    let freshness = self.inner.defaults.freshness;
    match self.inner.slots().get(&key.hash()) {
      Some(slot) => freshness.should_refetch(trigger, &slot.entry, now),
      None => freshness.should_refetch(trigger, &CacheEntry::pending(), now),
    }
  }

  /// Register an observer for `key`, pausing its eviction countdown.
  pub fn subscribe(&self, key: &QueryKey) -> usize {
    let mut slots = self.inner.slots();
    let slot = self.inner.slot_mut(&mut slots, key);
    slot.observers += 1;
    slot.entry.cancel_gc();
    slot.observers
  }

  /// Drop an observer. The last one out starts the eviction countdown.
  pub fn unsubscribe(&self, key: &QueryKey) {
    let now = self.now();
    let freshness = self.inner.defaults.freshness;
    let mut slots = self.inner.slots();
    if let Some(slot) = slots.get_mut(&key.hash()) {
      slot.observers = slot.observers.saturating_sub(1);
      if slot.observers == 0 {
        slot.entry.schedule_gc(now, &freshness);
      }
    }
  }

  pub fn remove_query(&self, key: &QueryKey) -> bool {
    match self.inner.slots().remove(&key.hash()) {
      Some(slot) => {
        if let Some(in_flight) = slot.in_flight {
          in_flight.abort.abort();
        }
        true
      }
      None => false,
    }
  }

  /// Evict every unobserved, idle entry whose GC deadline has passed.
  pub fn collect_garbage(&self) -> usize {
    let now = self.now();
    let mut slots = self.inner.slots();
    let before = slots.len();
    slots.retain(|_, slot| {
      slot.observers > 0
        || slot.in_flight.is_some()
        || slot.entry.gc_at.map_or(true, |at| at > now)
    });
    let evicted = before - slots.len();
    if evicted > 0 {
      debug!(evicted, "collected unobserved queries");
    }
    evicted
  }

  /// Sweep for expired entries every `period` until the client is dropped.
  pub fn spawn_gc(&self, period: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        QueryClient { inner }.collect_garbage();
      }
    })
  }

  pub fn len(&self) -> usize {
    self.inner.slots().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Abort everything in flight and drop all entries.
  pub fn clear(&self) {
    let mut slots = self.inner.slots();
    for slot in slots.values() {
      if let Some(in_flight) = &slot.in_flight {
        in_flight.abort.abort();
      }
    }
    slots.clear();
    info!("query cache cleared");
  }

  /// Snapshot every entry the hydration policy allows to transfer.
  pub fn dehydrate(&self) -> DehydratedState {
    let hydration = self.inner.defaults.hydration;
    let queries = self
      .inner
      .slots()
      .values()
      .filter(|slot| hydration.should_dehydrate(&slot.entry))
      .map(|slot| DehydratedQuery::capture(&slot.key, &slot.entry))
      .collect();
    DehydratedState { queries }
  }

  /// Load a snapshot into the cache.
  ///
  /// Entries already holding data at least as new as the snapshot's are kept.
  /// Nothing is applied if any entry fails to deserialize.
  pub fn hydrate(&self, state: DehydratedState) -> Result<usize, SerializeError> {
    let freshness = self.inner.defaults.freshness;
    let restored = state
      .queries
      .into_iter()
      .map(|query| query.restore(&freshness))
      .collect::<Result<Vec<_>, _>>()?;

    let now = self.now();
    let mut slots = self.inner.slots();
    let mut applied = 0;
    for (key, mut entry) in restored {
      let existed = slots.contains_key(&key.hash());
      let slot = self.inner.slot_mut(&mut slots, &key);

      let keep_existing = match (slot.entry.data_updated_at, entry.data_updated_at) {
        (Some(existing), Some(incoming)) => existing >= incoming,
        (Some(_), None) => true,
        (None, None) => existed || slot.in_flight.is_some(),
        (None, Some(_)) => false,
      };
      if keep_existing {
        continue;
      }

      if slot.observers == 0 {
        entry.schedule_gc(now, &freshness);
      }
      // Only restored data supersedes attempts already issued.
      if entry.data_updated_at.is_some() {
        slot.settled_seq = self.inner.issue_seq();
      }
      slot.entry = entry;
      applied += 1;
    }

    debug!(applied, "hydrated queries");
    Ok(applied)
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("mode", &self.inner.mode)
      .field("entries", &self.len())
      .finish_non_exhaustive()
  }
}
