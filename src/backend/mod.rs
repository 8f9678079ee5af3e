//! Backing key-value stores for pages and the generation counter.
//!
//! [`CacheBackend`] is the seam between the page cache and whatever shared
//! store a deployment runs. Two adapters ship with the crate:
//!
//! - [`MemoryBackend`] — in-process map with TTLs, for single-process
//!   deployments and tests.
//! - [`MemcachedBackend`] — memcached text protocol over one TCP connection.
//!
//! Keys handed to a backend are already prefixed; values are opaque bytes.

use std::{num::NonZeroU64, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod memcached;
mod memory;

pub use memcached::{DEFAULT_MAX_ITEM_BYTES, DEFAULT_POOL_SIZE, MemcachedBackend};
pub use memory::{DEFAULT_MAX_ENTRIES, MemoryBackend};

/// Expiry requested for a write.
///
/// `Never` and `Default` are deliberately distinct: a literal TTL of zero
/// seconds means "keep until evicted", while an omitted TTL defers to the
/// backend's configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    #[default]
    Default,
    Never,
    Seconds(NonZeroU64),
}

impl Ttl {
    /// Maps a TTL in seconds, treating `0` as [`Ttl::Never`].
    pub fn from_secs(secs: u64) -> Self {
        NonZeroU64::new(secs).map_or(Self::Never, Self::Seconds)
    }

    /// Resolves the expiry against a backend default. `None` means no expiry.
    pub fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Default => default,
            Self::Never => None,
            Self::Seconds(secs) => Some(Duration::from_secs(secs.get())),
        }
    }
}

/// Opaque compare-and-swap token returned by [`CacheBackend::gets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasToken(pub u64);

/// Errors raised by backing stores.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error talking to cache backend: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply from cache backend: {0}")]
    Protocol(String),

    #[error("key not found")]
    NotFound,

    #[error("stored value is not a decimal counter")]
    NotNumeric,

    #[error("counter is already at its maximum value")]
    Overflow,

    #[error("operation `{0}` is not supported by this backend")]
    Unsupported(&'static str),

    #[error("cached entry is corrupt: {0}")]
    Corrupt(&'static str),

    #[error("key {0:?} cannot be stored by this backend")]
    InvalidKey(String),
}

impl BackendError {
    /// `true` for failures that leave a connection in an unknown state.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_) | Self::Protocol(_))
    }
}

/// A shared key-value store.
///
/// Every call is a single round trip. Implementations must be safe to share
/// across tasks and, for `incr`, `add` and `compare_and_swap`, atomic with
/// respect to other clients of the same store.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Stores `value` unconditionally.
    async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), BackendError>;

    /// Stores `value` only if `key` is absent. Returns `false` when it exists.
    async fn add(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<bool, BackendError>;

    /// Atomically increments a decimal counter and returns the new value.
    ///
    /// Fails with [`BackendError::NotFound`] when the key is absent and
    /// [`BackendError::NotNumeric`] when the value is not a counter. Stores
    /// that check bounds report [`BackendError::Overflow`] at `u64::MAX`.
    async fn incr(&self, key: &str) -> Result<u64, BackendError>;

    /// Returns the value and its compare-and-swap token.
    async fn gets(&self, key: &str) -> Result<Option<(Bytes, CasToken)>, BackendError>;

    /// Stores `value` only if `key` still carries `token`. Returns `false` when
    /// another write happened in between.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        token: CasToken,
    ) -> Result<bool, BackendError>;
}
