//! Generation-keyed whole-page caching.
//!
//! Rendered pages are stored under a digest of the request identity and the
//! current *generation*, a counter kept in the backing store. Bumping the
//! generation, which the [`InvalidationTrigger`] does whenever a watched
//! entity changes, orphans every previously issued key at once. Orphaned
//! entries are left to expire by TTL.
//!
//! ## Core types
//!
//! - [`PageCache`] — wraps handlers (`with_default_ttl`, `with_ttl`) or a
//!   middleware chain (`layer`).
//! - [`CachePolicy`] — which requests and responses take part.
//! - [`RequestIdentity`] — the normalized tuple behind a cache key.
//! - [`GenerationStore`] — the shared counter.
//! - [`InvalidationTrigger`] and [`WatchPolicy`] — mutation-driven bumps.
//! - [`CacheStore`] and [`CachedPage`] — prefixed backend access and the
//!   stored entry format.

pub mod generation;
pub mod invalidation;
pub mod key;
pub mod page;
pub mod policy;
pub mod store;

pub use generation::{GENERATION_KEY, GenerationStore};
pub use invalidation::{INTERNAL_TYPES, InvalidationTrigger, WatchPolicy};
pub use key::{Generation, RequestIdentity, normalize_path};
pub use page::{CachePage, PageCache};
pub use policy::CachePolicy;
pub use store::{CacheStore, CachedPage};
