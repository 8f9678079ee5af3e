//! Per-request context: the request plus the request-scoped state the page
//! cache consults.
//!
//! Authentication, flash messaging and locale activation are owned by other
//! layers of the application. They publish their results into the
//! [`Extensions`] map as [`Identity`], [`FlashMessages`] and [`Locale`]; a
//! missing extension means the corresponding subsystem is not installed.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::Request;

pub mod locale;

pub use locale::{Locale, LocaleNegotiator};

/// Type-erased request extensions map.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Who is making the request, as resolved by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    /// An authenticated principal with its stable identifier.
    User { id: String },
}

impl Identity {
    pub fn user(id: impl ToString) -> Self {
        Self::User { id: id.to_string() }
    }

    /// The identifier that partitions cached pages per user.
    ///
    /// Anonymous requests and principals with a blank identifier share the
    /// empty string.
    pub fn cache_id(&self) -> &str {
        match self {
            Self::User { id } if !id.trim().is_empty() => id,
            _ => "",
        }
    }
}

/// Severity of a flash message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashMessage {
    pub level: MessageLevel,
    pub text: String,
}

/// User-facing notifications queued for display on the next rendered page.
#[derive(Debug, Clone, Default)]
pub struct FlashMessages {
    pending: Vec<FlashMessage>,
}

impl FlashMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: MessageLevel, text: impl Into<String>) {
        self.pending.push(FlashMessage {
            level,
            text: text.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlashMessage> {
        self.pending.iter()
    }
}

/// Shared flag recording that the anti-forgery cookie was read while the
/// request was handled.
///
/// Clones observe the same flag, so a layer can keep a handle while the
/// handler consumes the [`Context`].
#[derive(Debug, Clone, Default)]
pub struct CsrfCookie {
    used: Arc<AtomicBool>,
}

impl CsrfCookie {
    /// Marks the token as embedded in the response being rendered.
    pub fn mark_used(&self) {
        self.used.store(true, Ordering::Release);
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }
}

/// Per-request context handed to handlers and middleware.
pub struct Context {
    request: Request,
    extensions: Extensions,
    csrf: CsrfCookie,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
            csrf: CsrfCookie::default(),
        }
    }

    /// Builder form of [`Extensions::insert`].
    #[must_use]
    pub fn with_extension<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.extensions.insert(value);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The identity published by the authentication layer, if one is installed.
    pub fn identity(&self) -> Option<&Identity> {
        self.extensions.get::<Identity>()
    }

    /// Number of flash messages waiting to be shown. Zero when messaging is
    /// not installed.
    pub fn pending_messages(&self) -> usize {
        self.extensions.get::<FlashMessages>().map_or(0, FlashMessages::len)
    }

    pub fn csrf(&self) -> &CsrfCookie {
        &self.csrf
    }
}
