//! Typed RPC calls over HTTP, routed through the query cache.

mod client;
mod link;

pub use client::RpcClient;
pub use link::{derive_api_url, resolve_base_url, AuthHeaders, RpcLink};

use futures::future::BoxFuture;

use crate::error::RpcError;
use crate::serializer::Payload;

/// HTTP verb used for a procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
  Get,
  #[default]
  Post,
}

/// One procedure call: its dotted path split into segments, plus input.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
  pub path: Vec<String>,
  pub input: Payload,
  pub method: Method,
}

impl RpcRequest {
  pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>, input: Payload) -> Self {
    Self {
      path: path.into_iter().map(Into::into).collect(),
      input,
      method: Method::default(),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }
}

/// Anything that can carry a procedure call to the server.
///
/// Failures must already be classified into an [`RpcError`] kind; the retry
/// policy relies on it.
pub trait Transport: Send + Sync {
  fn call(&self, request: RpcRequest) -> BoxFuture<'static, Result<Payload, RpcError>>;
}
