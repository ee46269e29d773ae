//! Client-side query cache and retry engine for typed RPC calls.
//!
//! - [`serializer`] and [`key`]: payload encoding and stable query key hashes
//! - [`policy`]: per-mode retry, freshness and hydration rules
//! - [`cache`]: the shared [`QueryClient`] plus snapshot persistence
//! - [`query`]: observers that poll a cache entry
//! - [`rpc`]: HTTP transport and a cache-aware RPC client

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod policy;
pub mod query;
pub mod rpc;
pub mod serializer;

pub use cache::{CacheEntry, CacheSource, QueryClient, QueryResult, QueryStatus};
pub use config::{Config, EnvironmentMode};
pub use error::{ErrorKind, RpcError};
pub use key::QueryKey;
pub use query::{QueryObserver, QueryState};
pub use rpc::{RpcClient, RpcLink, Transport};
pub use serializer::Payload;
