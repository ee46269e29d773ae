//! RPC client that routes queries through the shared cache.

use color_eyre::Result;
use std::sync::Arc;

use super::{Method, RpcLink, RpcRequest, Transport};
use crate::cache::{QueryClient, QueryResult};
use crate::config::Config;
use crate::error::RpcError;
use crate::key::QueryKey;
use crate::query::QueryObserver;
use crate::serializer::Payload;

/// Procedure caller with transparent caching.
///
/// Queries are keyed by procedure path and input, deduplicated and cached
/// by the [`QueryClient`]. Mutations bypass the cache but follow the
/// mutation retry policy.
#[derive(Clone)]
pub struct RpcClient {
  transport: Arc<dyn Transport>,
  cache: QueryClient,
}

impl RpcClient {
  pub fn new(transport: Arc<dyn Transport>, cache: QueryClient) -> Self {
    Self { transport, cache }
  }

  /// HTTP client for the configured endpoint, sharing `cache`.
  pub fn from_config(config: &Config, cache: QueryClient) -> Result<Self> {
    let link = RpcLink::from_config(config, cache.mode())?;
    Ok(Self::new(Arc::new(link), cache))
  }

  pub fn cache(&self) -> &QueryClient {
    &self.cache
  }

  fn prepare<S: Into<String>>(
    path: impl IntoIterator<Item = S>,
    input: Option<Payload>,
    method: Method,
  ) -> (QueryKey, RpcRequest) {
    let request = RpcRequest::new(path, input.clone().unwrap_or(Payload::Undefined)).with_method(method);
    let key = QueryKey::rpc(request.path.iter().cloned(), input);
    (key, request)
  }

  fn fetcher(
    &self,
    request: RpcRequest,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Payload, RpcError>> + Send + Sync + 'static {
    let transport = Arc::clone(&self.transport);
    move || transport.call(request.clone())
  }

  /// Call a query procedure, serving fresh cached data when present.
  pub async fn query<S: Into<String>>(
    &self,
    path: impl IntoIterator<Item = S>,
    input: Option<Payload>,
    method: Method,
  ) -> Result<QueryResult, RpcError> {
    let (key, request) = Self::prepare(path, input, method);
    self.cache.fetch_query(&key, self.fetcher(request)).await
  }

  /// Call a query procedure, bypassing fresh cached data.
  pub async fn refetch<S: Into<String>>(
    &self,
    path: impl IntoIterator<Item = S>,
    input: Option<Payload>,
    method: Method,
  ) -> Result<QueryResult, RpcError> {
    let (key, request) = Self::prepare(path, input, method);
    self.cache.refetch_query(&key, self.fetcher(request)).await
  }

  /// Observer for a query procedure, for callers that poll.
  pub fn observe<S: Into<String>>(
    &self,
    path: impl IntoIterator<Item = S>,
    input: Option<Payload>,
  ) -> QueryObserver {
    let (key, request) = Self::prepare(path, input, Method::default());
    QueryObserver::new(self.cache.clone(), key, self.fetcher(request))
  }

  /// Call a mutation procedure. Results are never cached.
  pub async fn mutate<S: Into<String>>(
    &self,
    path: impl IntoIterator<Item = S>,
    input: Option<Payload>,
  ) -> Result<Payload, RpcError> {
    let request = RpcRequest::new(path, input.unwrap_or(Payload::Undefined));
    let call = self.fetcher(request);
    self.cache.execute_mutation(call).await
  }

  /// Mark every cached query under `path` stale.
  pub fn invalidate<S: Into<String>>(&self, path: impl IntoIterator<Item = S>) -> usize {
    self.cache.invalidate_queries(&QueryKey::rpc_path(path))
  }
}

impl std::fmt::Debug for RpcClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RpcClient")
      .field("cache", &self.cache)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::config::EnvironmentMode;
  use crate::error::ErrorKind;
  use futures::future::{BoxFuture, FutureExt};
  use std::sync::Mutex;

  /// Transport that records requests and answers from a closure.
  struct FakeTransport {
    calls: Mutex<Vec<RpcRequest>>,
    respond: Box<dyn Fn(&RpcRequest) -> Result<Payload, RpcError> + Send + Sync>,
  }

  impl FakeTransport {
    fn new(respond: impl Fn(&RpcRequest) -> Result<Payload, RpcError> + Send + Sync + 'static) -> Arc<Self> {
      Arc::new(Self {
        calls: Mutex::new(Vec::new()),
        respond: Box::new(respond),
      })
    }

    fn calls(&self) -> Vec<RpcRequest> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl Transport for FakeTransport {
    fn call(&self, request: RpcRequest) -> BoxFuture<'static, Result<Payload, RpcError>> {
      let result = (self.respond)(&request);
      self.calls.lock().unwrap().push(request);
      async move { result }.boxed()
    }
  }

  fn echo() -> Arc<FakeTransport> {
    FakeTransport::new(|req| Ok(Payload::from(req.path.join("."))))
  }

  fn client(transport: Arc<FakeTransport>) -> RpcClient {
    RpcClient::new(transport, QueryClient::new(EnvironmentMode::Production))
  }

  #[tokio::test]
  async fn test_query_is_cached_per_input() {
    let transport = echo();
    let rpc = client(transport.clone());

    let first = rpc.query(["user", "get"], Some(Payload::from(1)), Method::Post).await.unwrap();
    let again = rpc.query(["user", "get"], Some(Payload::from(1)), Method::Post).await.unwrap();
    let other = rpc.query(["user", "get"], Some(Payload::from(2)), Method::Post).await.unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(other.source, CacheSource::Network);
    assert_eq!(transport.calls().len(), 2);
    assert_eq!(*first.data, Payload::from("user.get"));
  }

  #[tokio::test]
  async fn test_query_without_input_sends_undefined() {
    let transport = echo();
    let rpc = client(transport.clone());

    rpc.query(["health"], None, Method::Get).await.unwrap();
    let calls = transport.calls();
    assert_eq!(calls[0].input, Payload::Undefined);
    assert_eq!(calls[0].method, Method::Get);
  }

  #[tokio::test]
  async fn test_invalidate_by_path_prefix() {
    let transport = echo();
    let rpc = client(transport.clone());

    rpc.query(["user", "get"], Some(Payload::from(1)), Method::Post).await.unwrap();
    rpc.query(["user", "list"], None, Method::Post).await.unwrap();
    rpc.query(["post", "list"], None, Method::Post).await.unwrap();

    assert_eq!(rpc.invalidate(["user"]), 2);
    let refreshed = rpc.query(["user", "list"], None, Method::Post).await.unwrap();
    assert_eq!(refreshed.source, CacheSource::Network);
    let untouched = rpc.query(["post", "list"], None, Method::Post).await.unwrap();
    assert_eq!(untouched.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_mutation_is_not_cached() {
    let transport = echo();
    let rpc = client(transport.clone());

    rpc.mutate(["user", "rename"], Some(Payload::from("Ada"))).await.unwrap();
    rpc.mutate(["user", "rename"], Some(Payload::from("Ada"))).await.unwrap();
    assert_eq!(transport.calls().len(), 2);
    assert!(rpc.cache().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_client_error_is_not_retried() {
    let transport = FakeTransport::new(|_| Err(RpcError::from_status(429, "slow down")));
    let rpc = client(transport.clone());

    let err = rpc.mutate(["user", "rename"], None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
    assert_eq!(transport.calls().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_network_error_retries() {
    let transport = FakeTransport::new(|_| Err(RpcError::network("offline")));
    let rpc = client(transport.clone());

    let err = rpc.query(["feed"], None, Method::Post).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(transport.calls().len(), 6);
  }

  #[tokio::test]
  async fn test_observer_reads_through_cache() {
    let transport = echo();
    let rpc = client(transport.clone());
    rpc.query(["user", "get"], None, Method::Post).await.unwrap();

    let mut observer = rpc.observe(["user", "get"], None);
    assert!(!observer.mount());
    assert_eq!(
      observer.data().map(|d| d.as_ref()),
      Some(&Payload::from("user.get"))
    );
    assert_eq!(transport.calls().len(), 1);
  }
}
