//! Middleware chain: ordered before/after logic around a terminal handler.
//!
//! The page cache is usually applied per view with
//! [`PageCache::with_ttl`](crate::cache::PageCache::with_ttl), but it also
//! implements [`Middleware`] (see [`CachePage`](crate::cache::CachePage)) so a
//! whole chain can be cached at once.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining chain; [`Next::run`] advances it.
//! - [`MiddlewareHandler`] — type-erased middleware function.
//! - [`from_middleware`] and [`endpoint`] — build chain entries.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    Response, StatusCode,
    context::Context,
    handler::{Handler, IntoHandler, into_handler},
};

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next entry of the chain.
    ///
    /// An exhausted chain answers `500 Internal Server Error`; terminate chains
    /// with [`endpoint`] to avoid that.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// Before/after logic around the rest of the chain.
///
/// Implementations may pass through (`next.run(ctx).await`), short-circuit by
/// returning a [`Response`] without calling `next`, or decorate the response
/// returned by `next`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Converts a [`Middleware`] into a chain entry.
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Terminal chain entry that calls `handler` and ignores the rest of the chain.
pub fn endpoint(handler: impl IntoHandler) -> MiddlewareHandler {
    let handler: Handler = into_handler(handler);
    Arc::new(move |ctx: Context, _next: Next| handler(ctx))
}
