use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use genpage::{
    BackendError, CacheBackend, CachePolicy, CacheStore, Context, DataEvents, Entity,
    FlashMessages, Handler, PageCache, Request, Response, StatusCode, Ttl, WatchPolicy,
    backend::{CasToken, MemoryBackend},
    cache::GENERATION_KEY,
    context::{LocaleNegotiator, MessageLevel},
};

struct Article;

impl Entity for Article {
    const ENTITY_TYPE: &'static str = "blog.Article";

    fn entity_id(&self) -> String {
        "1".to_owned()
    }
}

struct Comment;

impl Entity for Comment {
    const ENTITY_TYPE: &'static str = "blog.Comment";

    fn entity_id(&self) -> String {
        "9".to_owned()
    }
}

fn request(method: &str, target: &str) -> Context {
    let raw = format!("{method} {target} HTTP/1.1\r\nHost: example.test\r\n\r\n");
    let (req, _) = Request::parse(raw.as_bytes()).unwrap();
    Context::new(req)
}

fn get(target: &str) -> Context {
    request("GET", target)
}

fn page_cache(backend: Arc<dyn CacheBackend>) -> PageCache {
    PageCache::new(
        CacheStore::new(backend, ""),
        CachePolicy::default(),
        LocaleNegotiator::default(),
    )
}

/// A handler answering `text/plain` with a body that embeds its call count.
fn counted(calls: &Arc<AtomicUsize>) -> impl Fn(Context) -> std::future::Ready<Response> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_ctx: Context| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::future::ready(
            Response::new(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body(format!("render #{n}")),
        )
    }
}

async fn body(handler: &Handler, ctx: Context) -> String {
    let response = handler(ctx).await;
    String::from_utf8(response.body_ref().to_vec()).unwrap()
}

#[tokio::test]
async fn second_get_is_served_from_cache() {
    let cache = page_cache(Arc::new(MemoryBackend::default()));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = cache.with_default_ttl(counted(&calls));

    let first = handler(get("/plain")).await;
    let second = handler(get("/plain")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.status(), StatusCode::Ok);
    assert_eq!(first.body_ref(), second.body_ref());
    assert_eq!(second.body_ref().as_ref(), b"render #1");
    assert_eq!(second.content_type(), "text/plain");

    let key = cache.cache_key(&get("/plain")).await.unwrap();
    assert_eq!(first.headers().get("etag"), Some(key.as_str()));
    assert_eq!(second.headers().get("etag"), Some(key.as_str()));
}

#[tokio::test(start_paused = true)]
async fn zero_ttl_outlives_the_default() {
    let cache = page_cache(Arc::new(MemoryBackend::new(Duration::from_secs(300))));
    let forever_calls = Arc::new(AtomicUsize::new(0));
    let default_calls = Arc::new(AtomicUsize::new(0));
    let forever = cache.with_ttl(0, counted(&forever_calls));
    let default = cache.with_default_ttl(counted(&default_calls));

    forever(get("/forever")).await;
    default(get("/default")).await;

    tokio::time::advance(Duration::from_secs(301)).await;

    assert_eq!(body(&forever, get("/forever")).await, "render #1");
    assert_eq!(body(&default, get("/default")).await, "render #2");
    assert_eq!(forever_calls.load(Ordering::SeqCst), 1);
    assert_eq!(default_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn watched_mutations_retire_cached_pages() {
    let cache = page_cache(Arc::new(MemoryBackend::default()));
    let events = DataEvents::new();
    cache
        .invalidation_trigger(WatchPolicy::watch(["blog.Article"]))
        .register(&events);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = cache.with_default_ttl(counted(&calls));

    cache.clear().await.unwrap();
    assert_eq!(body(&handler, get("/")).await, "render #1");
    let generation = cache.generation().read().await.unwrap();

    events.created(&Comment).await;
    assert_eq!(cache.generation().read().await.unwrap(), generation);
    assert_eq!(body(&handler, get("/")).await, "render #1");

    events.created(&Article).await;
    assert_eq!(
        cache.generation().read().await.unwrap(),
        generation.map(|g| g + 1)
    );
    assert_eq!(body(&handler, get("/")).await, "render #2");
}

#[tokio::test]
async fn query_string_gets_its_own_entry() {
    let cache = page_cache(Arc::new(MemoryBackend::default()));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = cache.with_default_ttl(counted(&calls));

    assert_eq!(body(&handler, get("/list")).await, "render #1");
    assert_eq!(body(&handler, get("/list?foo=bar")).await, "render #2");
    assert_eq!(body(&handler, get("/list")).await, "render #1");
    assert_eq!(body(&handler, get("/list?foo=bar")).await, "render #2");
}

#[tokio::test]
async fn posts_and_pending_messages_bypass_the_cache() {
    let backend = Arc::new(MemoryBackend::default());
    let cache = page_cache(backend.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = cache.with_default_ttl(counted(&calls));

    let post = handler(request("POST", "/form")).await;
    handler(request("POST", "/form")).await;
    assert!(post.headers().get("etag").is_none());

    let mut messages = FlashMessages::new();
    messages.push(MessageLevel::Success, "Saved");
    let flashed = handler(get("/form").with_extension(messages)).await;
    assert!(flashed.headers().get("etag").is_none());

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn error_statuses_reach_the_client_uncached() {
    let backend = Arc::new(MemoryBackend::default());
    let cache = page_cache(backend.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = cache.with_default_ttl(move |_ctx: Context| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Response::new(StatusCode::ServiceUnavailable).body("busy"))
    });

    let first = handler(get("/status")).await;
    let second = handler(get("/status")).await;

    assert_eq!(first.status(), StatusCode::ServiceUnavailable);
    assert_eq!(second.status(), StatusCode::ServiceUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.get(&cache.cache_key(&get("/status")).await.unwrap()).await.unwrap().is_none());
}

/// Fails every call, or every call except those on the generation counter.
struct BrokenBackend {
    inner: MemoryBackend,
    generation_works: bool,
}

impl BrokenBackend {
    fn check(&self, key: &str) -> Result<(), BackendError> {
        if self.generation_works && key == GENERATION_KEY {
            Ok(())
        } else {
            Err(BackendError::Io(std::io::ErrorKind::ConnectionRefused.into()))
        }
    }
}

#[async_trait]
impl CacheBackend for BrokenBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.check(key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), BackendError> {
        self.check(key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<bool, BackendError> {
        self.check(key)?;
        self.inner.add(key, value, ttl).await
    }

    async fn incr(&self, key: &str) -> Result<u64, BackendError> {
        self.check(key)?;
        self.inner.incr(key).await
    }

    async fn gets(&self, key: &str) -> Result<Option<(Bytes, CasToken)>, BackendError> {
        self.check(key)?;
        self.inner.gets(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        token: CasToken,
    ) -> Result<bool, BackendError> {
        self.check(key)?;
        self.inner.compare_and_swap(key, value, ttl, token).await
    }
}

#[tokio::test]
async fn page_reads_and_writes_fail_open() {
    let cache = page_cache(Arc::new(BrokenBackend {
        inner: MemoryBackend::default(),
        generation_works: true,
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = cache.with_default_ttl(counted(&calls));

    let first = handler(get("/")).await;
    let second = handler(get("/")).await;

    assert_eq!(first.status(), StatusCode::Ok);
    assert_eq!(second.body_ref().as_ref(), b"render #2");
    assert!(second.headers().get("etag").is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreadable_generation_skips_the_cache() {
    let cache = page_cache(Arc::new(BrokenBackend {
        inner: MemoryBackend::default(),
        generation_works: false,
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = cache.with_default_ttl(counted(&calls));

    let response = handler(get("/")).await;
    assert_eq!(response.status(), StatusCode::Ok);
    assert!(response.headers().get("etag").is_none());
    assert!(cache.clear().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
