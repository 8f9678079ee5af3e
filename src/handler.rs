//! The handler shape shared by application views and the page cache.
//!
//! A handler is any `Fn(Context) -> impl Future<Output = Response>`. Wrapping
//! a handler in the page cache yields another [`Handler`], so cached and
//! uncached views compose the same way.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Response, context::Context};

/// Boxed future returned by a [`Handler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Type-erased, cheaply cloneable async handler.
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Implemented for every `Fn(Context) -> F` closure or function where `F` is a
/// `Send` future resolving to a [`Response`]. An erased [`Handler`] is wrapped
/// again with `move |ctx| handler(ctx)`.
pub trait IntoHandler: Send + Sync + 'static {
    /// Calls the handler, boxing the returned future.
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}

/// Erases the concrete handler type.
pub fn into_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| handler.call(ctx))
}
