//! Data-layer mutation notifications.
//!
//! Persistence code announces writes through [`DataEvents`]; subscribers such
//! as the page cache's invalidation trigger react to them. The hub owns no
//! storage itself.
//!
//! ```rust
//! use genpage::database::{DataEvents, Entity, MutationEvent};
//!
//! struct Article { id: u64 }
//!
//! impl Entity for Article {
//!     const ENTITY_TYPE: &'static str = "blog.Article";
//!     fn entity_id(&self) -> String { self.id.to_string() }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let events = DataEvents::new();
//! events.on_mutate("blog.Article", |event: MutationEvent| async move {
//!     println!("{} {}", event.entity_type, event.id);
//! });
//! events.created(&Article { id: 7 }).await;
//! # }
//! ```

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, warn};

/// A persisted record whose writes are announced through [`DataEvents`].
pub trait Entity: Send + Sync {
    /// Type label in `app.Model` form, e.g. `"blog.Article"`.
    const ENTITY_TYPE: &'static str;

    fn entity_id(&self) -> String;
}

/// Identifier of an entity type in `app.Model` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn of<E: Entity>() -> Self {
        Self(E::ENTITY_TYPE.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityType {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for EntityType {
    fn from(label: String) -> Self {
        Self(label)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Created,
    Updated,
    /// Sent before the row is removed.
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub kind: MutationKind,
    pub entity_type: EntityType,
    pub id: String,
}

impl MutationEvent {
    pub fn new(kind: MutationKind, entity_type: impl Into<EntityType>, id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn for_entity<E: Entity>(kind: MutationKind, entity: &E) -> Self {
        Self::new(kind, EntityType::of::<E>(), entity.entity_id())
    }
}

/// Boxed future returned by a [`MutationCallback`].
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type-erased subscriber.
pub type MutationCallback = Arc<dyn Fn(MutationEvent) -> CallbackFuture + Send + Sync + 'static>;

struct Subscription {
    /// `None` subscribes to every type.
    entity_type: Option<EntityType>,
    callback: MutationCallback,
}

/// Registry of mutation subscribers.
///
/// Cheap to clone; clones share the subscriber list.
#[derive(Clone, Default)]
pub struct DataEvents {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl DataEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `callback` to mutations of one entity type.
    pub fn on_mutate<F, Fut>(&self, entity_type: impl Into<EntityType>, callback: F)
    where
        F: Fn(MutationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(Some(entity_type.into()), erase(callback));
    }

    /// Subscribes `callback` to mutations of every entity type.
    pub fn on_any_mutation<F, Fut>(&self, callback: F)
    where
        F: Fn(MutationEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(None, erase(callback));
    }

    pub fn subscriber_count(&self) -> usize {
        self.read("subscriber_count").len()
    }

    /// Runs every matching subscriber in registration order and returns how
    /// many ran.
    pub async fn notify(&self, event: MutationEvent) -> usize {
        let matching: Vec<MutationCallback> = self
            .read("notify")
            .iter()
            .filter(|sub| {
                sub.entity_type
                    .as_ref()
                    .is_none_or(|entity_type| *entity_type == event.entity_type)
            })
            .map(|sub| Arc::clone(&sub.callback))
            .collect();

        debug!(
            kind = ?event.kind,
            entity_type = %event.entity_type,
            id = %event.id,
            subscribers = matching.len(),
            "dispatching mutation event"
        );
        for callback in &matching {
            callback(event.clone()).await;
        }
        matching.len()
    }

    pub async fn created<E: Entity>(&self, entity: &E) -> usize {
        self.notify(MutationEvent::for_entity(MutationKind::Created, entity))
            .await
    }

    pub async fn updated<E: Entity>(&self, entity: &E) -> usize {
        self.notify(MutationEvent::for_entity(MutationKind::Updated, entity))
            .await
    }

    pub async fn deleting<E: Entity>(&self, entity: &E) -> usize {
        self.notify(MutationEvent::for_entity(MutationKind::Deleting, entity))
            .await
    }

    fn subscribe(&self, entity_type: Option<EntityType>, callback: MutationCallback) {
        self.write("subscribe").push(Subscription {
            entity_type,
            callback,
        });
    }

    fn read(&self, op: &'static str) -> RwLockReadGuard<'_, Vec<Subscription>> {
        match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    lock_kind = "rwlock.read",
                    result = "poisoned_recovered",
                    "Recovered from poisoned subscriber lock"
                );
                poisoned.into_inner()
            }
        }
    }

    fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, Vec<Subscription>> {
        match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    lock_kind = "rwlock.write",
                    result = "poisoned_recovered",
                    "Recovered from poisoned subscriber lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

fn erase<F, Fut>(callback: F) -> MutationCallback
where
    F: Fn(MutationEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event: MutationEvent| Box::pin(callback(event)) as CallbackFuture)
}
