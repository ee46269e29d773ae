//! HTTP transport for procedure calls.
//!
//! Requests carry the serialized `{json, meta}` envelope and the session
//! cookie. Every failure is classified into an [`ErrorKind`] here, so nothing
//! downstream needs to look at reqwest errors or status codes.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, RETRY_AFTER, USER_AGENT};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Method, RpcRequest, Transport};
use crate::config::{Config, EnvironmentMode, RpcConfig};
use crate::error::{ErrorKind, RpcError};
use crate::serializer::{self, Payload, Serialized};

const LOCAL_API_URL: &str = "http://localhost:8000";

/// Headers attached to every call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthHeaders {
  /// Full `Cookie` header value, e.g. `st_auth.session_token=abc`
  pub cookie: Option<String>,
  pub user_agent: Option<String>,
}

impl AuthHeaders {
  pub fn new(rpc: &RpcConfig, session_token: Option<String>) -> Self {
    Self {
      cookie: session_token.map(|token| format!("{}={}", rpc.session_cookie, token)),
      user_agent: Some(
        rpc
          .user_agent
          .clone()
          .unwrap_or_else(|| format!("qcache/{}", env!("CARGO_PKG_VERSION"))),
      ),
    }
  }

  /// Build from config plus QCACHE_SESSION_TOKEN.
  pub fn from_env(rpc: &RpcConfig) -> Self {
    Self::new(rpc, Config::get_session_token())
  }

  fn to_header_map(&self) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = &self.cookie {
      headers.insert(
        COOKIE,
        HeaderValue::from_str(cookie).map_err(|e| eyre!("Invalid session cookie: {}", e))?,
      );
    }
    if let Some(agent) = &self.user_agent {
      headers.insert(
        USER_AGENT,
        HeaderValue::from_str(agent).map_err(|e| eyre!("Invalid user agent: {}", e))?,
      );
    }
    Ok(headers)
  }
}

/// Work out the API base URL.
///
/// Order: QCACHE_API_URL, configured `url`, derived from configured `origin`,
/// then the local development server. Production has no fallback.
pub fn resolve_base_url(rpc: &RpcConfig, mode: EnvironmentMode) -> Result<Url> {
  resolve_base_url_from(Config::get_api_url(), rpc, mode)
}

fn resolve_base_url_from(
  env_url: Option<String>,
  rpc: &RpcConfig,
  mode: EnvironmentMode,
) -> Result<Url> {
  if let Some(url) = env_url.or_else(|| rpc.url.clone()) {
    return Url::parse(&url).map_err(|e| eyre!("Invalid API URL '{}': {}", url, e));
  }

  if let Some(origin) = &rpc.origin {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid site origin '{}': {}", origin, e))?;
    return derive_api_url(&origin);
  }

  if mode.is_production() {
    return Err(eyre!(
      "No API URL configured. Set QCACHE_API_URL or rpc.url in the config file."
    ));
  }

  Url::parse(LOCAL_API_URL).map_err(|e| eyre!("Invalid local API URL: {}", e))
}

/// Map a site origin to its API host: `https://app.example.com` becomes
/// `https://api.example.com`. Local origins map to the local API server.
pub fn derive_api_url(origin: &Url) -> Result<Url> {
  let host = origin
    .host_str()
    .ok_or_else(|| eyre!("Site origin '{}' has no host", origin))?;

  if host.contains("localhost") || host.contains("127.0.0.1") {
    return Url::parse(LOCAL_API_URL).map_err(|e| eyre!("Invalid local API URL: {}", e));
  }

  let labels: Vec<&str> = host.split('.').collect();
  let base = if labels.len() >= 2 {
    labels[labels.len() - 2..].join(".")
  } else {
    host.to_string()
  };
  let base = base.strip_prefix("www.").unwrap_or(base.as_str());

  let derived = format!("{}://api.{}", origin.scheme(), base);
  Url::parse(&derived).map_err(|e| eyre!("Invalid derived API URL '{}': {}", derived, e))
}

/// reqwest-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct RpcLink {
  http: reqwest::Client,
  endpoint: Url,
}

impl RpcLink {
  pub fn new(endpoint: Url, headers: &AuthHeaders, timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .default_headers(headers.to_header_map()?)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, endpoint })
  }

  pub fn from_config(config: &Config, mode: EnvironmentMode) -> Result<Self> {
    let base = resolve_base_url(&config.rpc, mode)?;
    let endpoint = join_path(&base, &config.rpc.path)?;
    debug!(%endpoint, ?mode, "rpc endpoint resolved");

    Self::new(
      endpoint,
      &AuthHeaders::from_env(&config.rpc),
      Duration::from_secs(config.rpc.timeout_secs),
    )
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  /// `{endpoint}/{segment}/{segment}...`
  fn procedure_url(&self, path: &[String]) -> Result<Url, RpcError> {
    let mut url = self.endpoint.clone();
    url
      .path_segments_mut()
      .map_err(|_| RpcError::unclassified(format!("endpoint {} cannot take a path", self.endpoint)))?
      .pop_if_empty()
      .extend(path);
    Ok(url)
  }

  async fn send(&self, request: RpcRequest) -> Result<Payload, RpcError> {
    let mut url = self.procedure_url(&request.path)?;
    let envelope = serializer::serialize(&request.input).to_value();

    let builder = match request.method {
      Method::Post => self
        .http
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(envelope.to_string()),
      Method::Get => {
        url.query_pairs_mut().append_pair("data", &envelope.to_string());
        self.http.get(url)
      }
    };

    let response = builder.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();
    let retry_after = response
      .headers()
      .get(RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| parse_retry_after(v, Utc::now()));
    let body = response.bytes().await.map_err(|e| classify_transport(&e))?;

    if status.is_success() {
      decode_success(&body)
    } else {
      debug!(status = status.as_u16(), path = %request.path.join("."), "rpc call failed");
      Err(decode_failure(status.as_u16(), retry_after, &body))
    }
  }
}

impl Transport for RpcLink {
  fn call(&self, request: RpcRequest) -> BoxFuture<'static, Result<Payload, RpcError>> {
    let link = self.clone();
    async move { link.send(request).await }.boxed()
  }
}

fn join_path(base: &Url, path: &str) -> Result<Url> {
  let joined = format!(
    "{}/{}",
    base.as_str().trim_end_matches('/'),
    path.trim_start_matches('/')
  );
  Url::parse(&joined).map_err(|e| eyre!("Invalid RPC endpoint '{}': {}", joined, e))
}

/// Classify a reqwest failure that produced no HTTP status.
fn classify_transport(err: &reqwest::Error) -> RpcError {
  if err.is_timeout() {
    RpcError::timeout(err.to_string())
  } else if err.is_connect() || err.is_request() {
    RpcError::network(err.to_string())
  } else if let Some(status) = err.status() {
    RpcError::from_status(status.as_u16(), err.to_string())
  } else {
    RpcError::unclassified(err.to_string())
  }
}

/// `Retry-After` is either delay-seconds or an HTTP date.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
  let value = value.trim();
  if let Ok(seconds) = value.parse::<f64>() {
    return Duration::try_from_secs_f64(seconds).ok();
  }
  let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
  Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn decode_success(body: &[u8]) -> Result<Payload, RpcError> {
  if body.is_empty() {
    return Ok(Payload::Undefined);
  }
  let envelope: Serialized = serde_json::from_slice(body)
    .map_err(|e| RpcError::unclassified(format!("undecodable response: {}", e)))?;
  serializer::deserialize(envelope.json, &envelope.meta)
    .map_err(|e| RpcError::unclassified(format!("undecodable response: {}", e)))
}

/// Build the error for a non-2xx response. The body may carry a message and
/// a `data.retryAfter` hint in seconds, either bare or inside the envelope.
fn decode_failure(status: u16, header_retry_after: Option<Duration>, body: &[u8]) -> RpcError {
  let parsed: Option<Value> = serde_json::from_slice(body).ok();
  let error = parsed
    .as_ref()
    .map(|v| v.get("json").unwrap_or(v))
    .filter(|v| v.is_object());

  let message = error
    .and_then(|e| e.get("message"))
    .and_then(Value::as_str)
    .map(String::from)
    .unwrap_or_else(|| format!("HTTP {}", status));

  let body_retry_after = error
    .and_then(|e| e.pointer("/data/retryAfter"))
    .and_then(Value::as_f64)
    .and_then(|s| Duration::try_from_secs_f64(s).ok());

  let err = RpcError::from_status(status, message);
  match header_retry_after.or(body_retry_after) {
    Some(after) if err.kind == ErrorKind::RateLimited => err.with_retry_after(after),
    _ => err,
  }
}
