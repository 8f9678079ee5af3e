//! Wiring a [`PageCache`] from [`Settings`].

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::info;

use crate::{
    backend::{BackendError, CacheBackend, MemcachedBackend, MemoryBackend},
    cache::{CachePolicy, CacheStore, PageCache},
    config::{self, BackendKind, LoadError, Settings},
    context::LocaleNegotiator,
    database::DataEvents,
    logging::{self, LoggingError},
};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("failed to bump the cache generation at startup: {0}")]
    Generation(#[from] BackendError),
}

/// Builds the backing store selected by `settings.backend`.
pub fn build_backend(settings: &Settings) -> Arc<dyn CacheBackend> {
    let default_ttl = settings.cache.default_ttl;
    match settings.backend.kind {
        BackendKind::Memory => Arc::new(MemoryBackend::with_capacity(
            default_ttl,
            settings.backend.max_entries,
        )),
        BackendKind::Memcached => Arc::new(
            MemcachedBackend::new(
                settings.backend.address.clone(),
                default_ttl,
                settings.backend.io_timeout,
            )
            .with_pool_size(settings.backend.pool_size)
            .with_max_item_bytes(settings.backend.max_item_bytes),
        ),
    }
}

/// Builds the page cache over `backend`, subscribes its invalidation trigger
/// to `events` and bumps the generation once, so pages rendered by a previous
/// deployment are never served.
pub async fn bootstrap_with_backend(
    settings: &Settings,
    backend: Arc<dyn CacheBackend>,
    events: &DataEvents,
) -> Result<PageCache, BootstrapError> {
    let store = CacheStore::new(backend, settings.cache.key_prefix.clone());
    let locales = LocaleNegotiator::new(
        settings.locale.default.clone(),
        settings.locale.supported.clone(),
    );
    let cache = PageCache::new(store, CachePolicy::new(settings.cache.disabled), locales);

    cache
        .invalidation_trigger(settings.invalidation.clone())
        .register(events);

    let generation = cache.clear().await?;
    info!(
        backend = ?settings.backend.kind,
        key_prefix = %settings.cache.key_prefix,
        disabled = settings.cache.disabled,
        generation,
        "page cache ready"
    );
    Ok(cache)
}

/// [`bootstrap_with_backend`] over the backend named by the settings.
pub async fn bootstrap(settings: &Settings, events: &DataEvents) -> Result<PageCache, BootstrapError> {
    bootstrap_with_backend(settings, build_backend(settings), events).await
}

/// Loads configuration, installs logging, then bootstraps the cache.
pub async fn start(
    config_file: Option<&Path>,
    events: &DataEvents,
) -> Result<(Settings, PageCache), BootstrapError> {
    let settings = config::load(config_file)?;
    logging::init(&settings.logging)?;
    let cache = bootstrap(&settings, events).await?;
    Ok((settings, cache))
}
