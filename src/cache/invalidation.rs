//! Generation bumps driven by data-layer mutations.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::generation::GenerationStore;
use crate::{
    backend::BackendError,
    database::{DataEvents, EntityType, MutationEvent},
};

/// Framework-internal types whose writes never change rendered pages.
pub const INTERNAL_TYPES: [&str; 5] = [
    "sessions.Session",
    "admin.LogEntry",
    "contenttypes.ContentType",
    "auth.Permission",
    "migrations.Migration",
];

/// Which entity types invalidate cached pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPolicy {
    /// Only mutations of these types invalidate.
    Watch(BTreeSet<EntityType>),
    /// Mutations of every type except these invalidate.
    Ignore(BTreeSet<EntityType>),
}

impl WatchPolicy {
    pub fn watch<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        Self::Watch(types.into_iter().map(Into::into).collect())
    }

    pub fn ignore<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        Self::Ignore(types.into_iter().map(Into::into).collect())
    }

    /// Ignores [`INTERNAL_TYPES`] and watches everything else.
    pub fn ignore_internal() -> Self {
        Self::ignore(INTERNAL_TYPES)
    }

    pub fn matches(&self, entity_type: &EntityType) -> bool {
        match self {
            Self::Watch(types) => types.contains(entity_type),
            Self::Ignore(types) => !types.contains(entity_type),
        }
    }
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self::Watch(BTreeSet::new())
    }
}

/// Bumps the generation whenever a watched entity is created, updated or
/// about to be deleted.
#[derive(Clone)]
pub struct InvalidationTrigger {
    generation: GenerationStore,
    policy: WatchPolicy,
}

impl InvalidationTrigger {
    pub fn new(generation: GenerationStore, policy: WatchPolicy) -> Self {
        Self { generation, policy }
    }

    pub fn policy(&self) -> &WatchPolicy {
        &self.policy
    }

    /// Subscribes the trigger to every mutation announced on `events`.
    pub fn register(&self, events: &DataEvents) {
        let trigger = self.clone();
        events.on_any_mutation(move |event: MutationEvent| {
            let trigger = trigger.clone();
            async move {
                if let Err(err) = trigger.on_mutation(&event).await {
                    warn!(
                        entity_type = %event.entity_type,
                        id = %event.id,
                        error = %err,
                        "failed to bump cache generation"
                    );
                }
            }
        });
        info!(policy = ?self.policy, "page cache invalidation registered");
    }

    /// Returns the new generation, or `None` when the type is not watched.
    pub async fn on_mutation(&self, event: &MutationEvent) -> Result<Option<u64>, BackendError> {
        if !self.policy.matches(&event.entity_type) {
            return Ok(None);
        }
        let generation = self.generation.increment().await?;
        debug!(
            kind = ?event.kind,
            entity_type = %event.entity_type,
            generation,
            "cache invalidated"
        );
        Ok(Some(generation))
    }
}
