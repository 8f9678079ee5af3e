//! The shared generation counter.
//!
//! Every page key embeds the current generation, so bumping it makes every
//! previously issued key unreachable without enumerating them.

use bytes::Bytes;
use tracing::{debug, warn};

use super::store::CacheStore;
use crate::backend::{BackendError, Ttl};

/// Well-known key of the counter, before prefixing.
pub const GENERATION_KEY: &str = "generation";

const INITIAL: &[u8] = b"1";

/// Reads and bumps the generation counter in the backing store.
#[derive(Clone)]
pub struct GenerationStore {
    store: CacheStore,
}

impl GenerationStore {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// The current generation, or `None` when it has never been bumped (or
    /// was evicted).
    ///
    /// A value that is not a decimal counter reads as `None`.
    pub async fn read(&self) -> Result<Option<u64>, BackendError> {
        let Some(raw) = self.store.get(GENERATION_KEY).await? else {
            return Ok(None);
        };
        Ok(parse(&raw))
    }

    /// Bumps the counter and returns the new generation.
    ///
    /// A missing counter starts at 1 through add-if-absent, so a concurrent
    /// initializer can never lower a counter another client already bumped.
    /// A counter at `u64::MAX` is left alone and reported as
    /// [`BackendError::Overflow`].
    pub async fn increment(&self) -> Result<u64, BackendError> {
        loop {
            match self.store.incr(GENERATION_KEY).await {
                Ok(next) => {
                    debug!(generation = next, "generation bumped");
                    return Ok(next);
                }
                Err(BackendError::NotFound) => {
                    if self.initialize().await? {
                        return Ok(1);
                    }
                    // Lost the race to another initializer; incr again.
                }
                Err(BackendError::NotNumeric) => {
                    warn!(key = GENERATION_KEY, "generation is not numeric, resetting to 1");
                    self.store
                        .set(GENERATION_KEY, Bytes::from_static(INITIAL), Ttl::Never)
                        .await?;
                    return Ok(1);
                }
                Err(BackendError::Unsupported(_)) => return self.increment_cas().await,
                Err(err) => return Err(err),
            }
        }
    }

    async fn initialize(&self) -> Result<bool, BackendError> {
        let added = self
            .store
            .add(GENERATION_KEY, Bytes::from_static(INITIAL), Ttl::Never)
            .await?;
        if added {
            debug!(generation = 1, "generation initialized");
        }
        Ok(added)
    }

    async fn increment_cas(&self) -> Result<u64, BackendError> {
        loop {
            let Some((raw, token)) = self.store.gets(GENERATION_KEY).await? else {
                if self.initialize().await? {
                    return Ok(1);
                }
                continue;
            };
            let next = match parse(&raw) {
                Some(current) => current.checked_add(1).ok_or(BackendError::Overflow)?,
                None => 1,
            };
            let swapped = match self
                .store
                .compare_and_swap(GENERATION_KEY, Bytes::from(next.to_string()), Ttl::Never, token)
                .await
            {
                Ok(swapped) => swapped,
                // Evicted between gets and cas.
                Err(BackendError::NotFound) => false,
                Err(err) => return Err(err),
            };
            if swapped {
                debug!(generation = next, "generation bumped via compare-and-swap");
                return Ok(next);
            }
        }
    }
}

fn parse(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}
