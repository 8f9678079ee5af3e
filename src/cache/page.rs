//! The page cache decorator and its middleware form.

use std::{future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use super::{
    generation::GenerationStore,
    invalidation::{InvalidationTrigger, WatchPolicy},
    key::RequestIdentity,
    policy::CachePolicy,
    store::{CacheStore, CachedPage},
};
use crate::{
    Response, StatusCode,
    backend::{BackendError, Ttl},
    context::{Context, LocaleNegotiator},
    handler::{Handler, HandlerFuture, IntoHandler, into_handler},
    middleware::{Middleware, Next},
};

struct Inner {
    store: CacheStore,
    generation: GenerationStore,
    policy: CachePolicy,
    locales: LocaleNegotiator,
}

/// Whole-page cache for handlers.
///
/// Cacheable requests are keyed by [`RequestIdentity`] under the current
/// generation. A hit is answered from the store without running the handler;
/// a miss runs it and stores the (body, content type) pair when the response
/// qualifies. Either way the response carries an `ETag` equal to the key.
///
/// Backend failures never fail a request: a failed lookup is a miss, a failed
/// write is logged, and a failed generation read skips the cache entirely.
///
/// ```rust
/// use std::sync::Arc;
///
/// use genpage::{
///     Context, Response, StatusCode,
///     backend::MemoryBackend,
///     cache::{CachePolicy, CacheStore, PageCache},
///     context::LocaleNegotiator,
/// };
///
/// let store = CacheStore::new(Arc::new(MemoryBackend::default()), "site");
/// let cache = PageCache::new(store, CachePolicy::default(), LocaleNegotiator::default());
///
/// let home = cache.with_default_ttl(|_ctx: Context| async {
///     Response::new(StatusCode::Ok).body("home")
/// });
/// let about = cache.with_ttl(0, |_ctx: Context| async {
///     Response::new(StatusCode::Ok).body("about")
/// });
/// # let _ = (home, about);
/// ```
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<Inner>,
}

impl PageCache {
    pub fn new(store: CacheStore, policy: CachePolicy, locales: LocaleNegotiator) -> Self {
        let generation = GenerationStore::new(store.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                generation,
                policy,
                locales,
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn generation(&self) -> &GenerationStore {
        &self.inner.generation
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Wraps `handler`, storing pages with the backend's default TTL.
    pub fn with_default_ttl(&self, handler: impl IntoHandler) -> Handler {
        self.wrap(Ttl::Default, handler)
    }

    /// Wraps `handler`, storing pages for `seconds`. Zero keeps them until the
    /// generation moves on or the backend evicts them.
    pub fn with_ttl(&self, seconds: u64, handler: impl IntoHandler) -> Handler {
        self.wrap(Ttl::from_secs(seconds), handler)
    }

    /// The cache as a [`Middleware`], caching whatever the rest of the chain
    /// renders.
    pub fn layer(&self, ttl: Ttl) -> CachePage {
        CachePage {
            cache: self.clone(),
            ttl,
        }
    }

    /// A trigger bumping this cache's generation on mutations matching `policy`.
    pub fn invalidation_trigger(&self, policy: WatchPolicy) -> InvalidationTrigger {
        InvalidationTrigger::new(self.inner.generation.clone(), policy)
    }

    /// Invalidates every cached page. Returns the new generation.
    pub async fn clear(&self) -> Result<u64, BackendError> {
        self.inner.generation.increment().await
    }

    /// The key `ctx` would be cached under right now.
    pub async fn cache_key(&self, ctx: &Context) -> Result<String, BackendError> {
        let generation = self.inner.generation.read().await?;
        Ok(RequestIdentity::from_context(ctx, generation, &self.inner.locales).fingerprint())
    }

    fn wrap(&self, ttl: Ttl, handler: impl IntoHandler) -> Handler {
        let cache = self.clone();
        let handler = into_handler(handler);
        Arc::new(move |ctx: Context| -> HandlerFuture {
            let cache = cache.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move { cache.serve(ctx, ttl, move |ctx| handler(ctx)).await })
        })
    }

    async fn serve<F, Fut>(&self, ctx: Context, ttl: Ttl, render: F) -> Response
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Response>,
    {
        let Inner { store, policy, .. } = &*self.inner;
        if !policy.request_is_cacheable(&ctx) {
            return render(ctx).await;
        }

        let path = ctx.request().path().to_owned();
        let key = match self.cache_key(&ctx).await {
            Ok(key) => key,
            Err(err) => {
                warn!(path = %path, error = %err, "generation unavailable, bypassing page cache");
                return render(ctx).await;
            }
        };

        match store.get_page(&key).await {
            Ok(Some(page)) => {
                debug!(path = %path, key = %key, outcome = "hit", "serving cached page");
                return Response::new(StatusCode::Ok)
                    .header("Content-Type", page.content_type)
                    .header("ETag", key)
                    .body_bytes(page.body);
            }
            Ok(None) => debug!(path = %path, key = %key, outcome = "miss", "rendering page"),
            Err(err) => warn!(path = %path, key = %key, error = %err, "page lookup failed, rendering"),
        }

        let csrf = ctx.csrf().clone();
        let mut response = render(ctx).await;

        if policy.response_is_cacheable(&csrf, &response) {
            let page = CachedPage::new(response.body_ref().clone(), response.content_type());
            match store.set_page(&key, &page, ttl).await {
                Ok(()) => debug!(path = %path, key = %key, ttl = ?ttl, "stored page"),
                Err(err) => warn!(path = %path, key = %key, error = %err, "failed to store page"),
            }
        } else {
            debug!(path = %path, status = response.status().as_u16(), "response not cacheable");
        }

        response.set_header("ETag", key);
        response
    }
}

/// [`PageCache`] as a chain entry. Built by [`PageCache::layer`].
pub struct CachePage {
    cache: PageCache,
    ttl: Ttl,
}

impl Middleware for CachePage {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cache = self.cache.clone();
        let ttl = self.ttl;
        Box::pin(async move { cache.serve(ctx, ttl, move |ctx| next.run(ctx)).await })
    }
}
