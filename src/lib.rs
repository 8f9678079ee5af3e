//! # genpage
//!
//! Generation-keyed whole-page response caching for async Rust handlers.
//!
//! A [`PageCache`] wraps a handler, stores its rendered output under a digest
//! of the request (path, query, locale, user and the current *generation*),
//! and answers later matching requests from the store. Writes to watched
//! entities bump the generation through [`DataEvents`], which retires every
//! cached page at once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use genpage::{Context, DataEvents, Response, StatusCode, bootstrap, config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = config::load(None)?;
//!     genpage::logging::init(&settings.logging)?;
//!
//!     let events = DataEvents::new();
//!     let cache = bootstrap::bootstrap(&settings, &events).await?;
//!
//!     let home = cache.with_default_ttl(|_ctx: Context| async {
//!         Response::new(StatusCode::Ok).body("Hello, World!")
//!     });
//!     # let _ = home;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod context;
pub mod database;
pub mod handler;
pub mod http;
pub mod logging;
pub mod middleware;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use backend::{BackendError, CacheBackend, Ttl};
pub use cache::{CachePolicy, CacheStore, PageCache, WatchPolicy};
pub use context::{Context, CsrfCookie, FlashMessages, Identity, Locale};
pub use database::{DataEvents, Entity, MutationEvent, MutationKind};
pub use handler::{Handler, IntoHandler};
pub use http::{Headers, Method, Request, Response, StatusCode};
