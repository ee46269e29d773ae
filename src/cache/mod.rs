//! In-memory query cache with snapshot persistence.
//!
//! This module provides:
//! - Cache entries keyed by the hash of a [`QueryKey`](crate::key::QueryKey)
//! - A shared [`QueryClient`] that deduplicates and orders fetches
//! - Dehydration into a serializable snapshot and hydration back out of one
//! - SQLite storage for snapshots between process runs

mod client;
mod clock;
mod entry;
mod hydration;
mod storage;

pub use client::QueryClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, CacheSource, QueryResult, QueryStatus};
pub use hydration::{DehydratedEntry, DehydratedQuery, DehydratedState};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
