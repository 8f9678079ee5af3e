use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BackendError, CacheBackend, CasToken, Ttl};

const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Entry limit used by [`MemoryBackend::new`].
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Expired entries whose keys are never touched again are swept at most this
/// often, on the next write.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
    cas: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

struct State {
    entries: LruCache<String, Entry>,
    next_cas: u64,
    next_sweep: Instant,
}

impl State {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
            next_cas: 0,
            next_sweep: Instant::now() + SWEEP_INTERVAL,
        }
    }

    // Drops the entry if it has expired, then returns it.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.peek(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.pop(key);
        }
        self.entries.get_mut(key)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    // Inserting past capacity evicts the least recently used entry.
    fn write(&mut self, key: &str, value: Bytes, expires_at: Option<Instant>, now: Instant) {
        if now >= self.next_sweep {
            let purged = self.purge_expired(now);
            if purged > 0 {
                debug!(purged, "swept expired memory backend entries");
            }
            self.next_sweep = now + SWEEP_INTERVAL;
        }

        self.next_cas += 1;
        self.entries.put(
            key.to_owned(),
            Entry {
                value,
                expires_at,
                cas: self.next_cas,
            },
        );
    }
}

/// In-process [`CacheBackend`] with per-entry expiry and an entry limit.
///
/// Every operation takes the map lock once and never awaits while holding it,
/// so `incr`, `add` and `compare_and_swap` are atomic. Expiry follows
/// [`tokio::time::Instant`], which lets tests drive it with paused time.
///
/// Keys from retired generations are never read again, so expired entries
/// are also swept periodically, and once `max_entries` is reached the least
/// recently used entry makes room for the new one.
pub struct MemoryBackend {
    state: Mutex<State>,
    default_ttl: Option<Duration>,
    incr_supported: bool,
}

impl MemoryBackend {
    /// Creates a store whose [`Ttl::Default`] writes expire after `default_ttl`,
    /// holding at most [`DEFAULT_MAX_ENTRIES`] entries.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_capacity(default_ttl, DEFAULT_MAX_ENTRIES)
    }

    /// Like [`MemoryBackend::new`] with an explicit entry limit. Zero is
    /// clamped to one.
    pub fn with_capacity(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(State::new(max_entries)),
            default_ttl: Some(default_ttl),
            incr_supported: true,
        }
    }

    /// Makes [`CacheBackend::incr`] report [`BackendError::Unsupported`], as
    /// stores without a native counter do.
    #[must_use]
    pub fn without_incr(mut self) -> Self {
        self.incr_supported = false;
        self
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock("len")
            .entries
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Ttl, now: Instant) -> Option<Instant> {
        ttl.resolve(self.default_ttl).map(|after| now + after)
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    result = "poisoned_recovered",
                    "Recovered from poisoned memory backend lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let now = Instant::now();
        Ok(self.lock("get").live(key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), BackendError> {
        let now = Instant::now();
        let expires_at = self.expiry(ttl, now);
        self.lock("set").write(key, value, expires_at, now);
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<bool, BackendError> {
        let now = Instant::now();
        let expires_at = self.expiry(ttl, now);
        let mut state = self.lock("add");
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.write(key, value, expires_at, now);
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<u64, BackendError> {
        if !self.incr_supported {
            return Err(BackendError::Unsupported("incr"));
        }

        let now = Instant::now();
        let mut state = self.lock("incr");
        let entry = state.live(key, now).ok_or(BackendError::NotFound)?;
        let current: u64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(BackendError::NotNumeric)?;
        let next = current.checked_add(1).ok_or(BackendError::Overflow)?;
        let expires_at = entry.expires_at;
        state.write(key, Bytes::from(next.to_string()), expires_at, now);
        Ok(next)
    }

    async fn gets(&self, key: &str) -> Result<Option<(Bytes, CasToken)>, BackendError> {
        let now = Instant::now();
        Ok(self
            .lock("gets")
            .live(key, now)
            .map(|e| (e.value.clone(), CasToken(e.cas))))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        token: CasToken,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let expires_at = self.expiry(ttl, now);
        let mut state = self.lock("compare_and_swap");
        let current = state.live(key, now).map(|entry| entry.cas);
        match current {
            Some(cas) if cas == token.0 => {
                state.write(key, value, expires_at, now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BackendError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn default_ttl_expires_but_never_does_not() {
        let store = MemoryBackend::new(Duration::from_secs(300));
        store.set("default", b("a"), Ttl::Default).await.unwrap();
        store.set("forever", b("b"), Ttl::Never).await.unwrap();
        store.set("short", b("c"), Ttl::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.get("default").await.unwrap(), Some(b("a")));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(store.get("default").await.unwrap().is_none());
        assert_eq!(store.get("forever").await.unwrap(), Some(b("b")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn incr_requires_an_existing_counter() {
        let store = MemoryBackend::default();
        assert!(matches!(store.incr("n").await, Err(BackendError::NotFound)));

        store.set("n", b("41"), Ttl::Never).await.unwrap();
        assert_eq!(store.incr("n").await.unwrap(), 42);
        assert_eq!(store.get("n").await.unwrap(), Some(b("42")));

        store.set("text", b("abc"), Ttl::Never).await.unwrap();
        assert!(matches!(store.incr("text").await, Err(BackendError::NotNumeric)));
    }

    #[tokio::test]
    async fn add_only_writes_absent_keys() {
        let store = MemoryBackend::default();
        assert!(store.add("k", b("1"), Ttl::Never).await.unwrap());
        assert!(!store.add("k", b("2"), Ttl::Never).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b("1")));
    }

    #[tokio::test]
    async fn compare_and_swap_detects_interleaved_writes() {
        let store = MemoryBackend::default();
        store.set("k", b("1"), Ttl::Never).await.unwrap();
        let (_, token) = store.gets("k").await.unwrap().unwrap();

        store.set("k", b("5"), Ttl::Never).await.unwrap();
        assert!(!store.compare_and_swap("k", b("2"), Ttl::Never, token).await.unwrap());

        let (_, token) = store.gets("k").await.unwrap().unwrap();
        assert!(store.compare_and_swap("k", b("6"), Ttl::Never, token).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b("6")));
    }

    #[tokio::test]
    async fn incr_refuses_to_wrap() {
        let store = MemoryBackend::default();
        store.set("n", b("18446744073709551615"), Ttl::Never).await.unwrap();
        assert!(matches!(store.incr("n").await, Err(BackendError::Overflow)));
        assert_eq!(store.get("n").await.unwrap(), Some(b("18446744073709551615")));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = MemoryBackend::with_capacity(Duration::from_secs(300), 100);
        store.set("generation", b("1"), Ttl::Never).await.unwrap();
        for i in 0..1_000 {
            store.set(&format!("page:{i}"), b("x"), Ttl::Never).await.unwrap();
            if i % 50 == 0 {
                store.get("generation").await.unwrap();
            }
        }

        assert_eq!(store.lock("test").entries.len(), 100);
        assert!(store.get("page:0").await.unwrap().is_none());
        assert_eq!(store.get("page:999").await.unwrap(), Some(b("x")));
        assert_eq!(store.get("generation").await.unwrap(), Some(b("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn retired_generation_pages_are_swept() {
        let store = MemoryBackend::with_capacity(Duration::from_secs(300), 20_000);
        for i in 0..10_000 {
            store.set(&format!("gen1:{i}"), b("page"), Ttl::Default).await.unwrap();
        }
        assert_eq!(store.lock("test").entries.len(), 10_000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        for i in 0..10 {
            store.set(&format!("gen2:{i}"), b("page"), Ttl::Default).await.unwrap();
            assert!(store.get(&format!("gen2:{i}")).await.unwrap().is_some());
        }

        assert_eq!(store.lock("test").entries.len(), 10);
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn without_incr_reports_unsupported() {
        let store = MemoryBackend::default().without_incr();
        store.set("n", b("1"), Ttl::Never).await.unwrap();
        assert!(matches!(store.incr("n").await, Err(BackendError::Unsupported("incr"))));
    }
}
