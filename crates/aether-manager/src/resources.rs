//! Locally-owned resources (guilds) that are re-announced after reconciliation.
//!
//! The registry is fed by inbound `GUILD_CREATE` / `GUILD_DELETE`. A create may
//! carry a `discovery` listing, which is what `DISCOVERY_UPDATE` reports.
//! Embedders can also call [`ResourceRegistry::set_discoverable`] directly.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::bridge::protocol::{
    DiscoverableResource, Envelope, EventType, ResourceAnnouncement, ResourceGone, ResourceRecord,
};
use crate::dispatch::{EventHandler, HandlerError};
use crate::state::WorkerState;

/// Source of the manager's current resource set.
pub trait ResourceSource: Send + Sync {
    /// Every resource this manager currently owns.
    fn owned(&self) -> Vec<ResourceRecord>;

    /// Resources that opted into public discovery.
    fn discoverable(&self) -> Vec<DiscoverableResource> {
        Vec::new()
    }
}

struct Owned {
    record: ResourceRecord,
    discovery: Option<DiscoverableResource>,
}

/// Concurrent in-memory resource set.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: DashMap<String, Owned>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ownership. Replaces the snapshot if the id is already known,
    /// keeping its discovery listing.
    pub fn insert(&self, record: ResourceRecord) {
        match self.entries.entry(record.id.clone()) {
            Entry::Occupied(mut owned) => owned.get_mut().record = record,
            Entry::Vacant(slot) => {
                slot.insert(Owned {
                    record,
                    discovery: None,
                });
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<ResourceRecord> {
        self.entries.remove(id).map(|(_, entry)| entry.record)
    }

    /// Set or clear the discovery listing for an owned resource.
    ///
    /// Returns `false` if the resource is not owned.
    pub fn set_discoverable(&self, id: &str, discovery: Option<DiscoverableResource>) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.discovery = discovery;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl ResourceSource for ResourceRegistry {
    fn owned(&self) -> Vec<ResourceRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    fn discoverable(&self) -> Vec<DiscoverableResource> {
        self.entries
            .iter()
            .filter_map(|e| e.discovery.clone())
            .collect()
    }
}

/// Keeps the registry in step with `GUILD_CREATE` / `GUILD_DELETE`.
pub struct OwnershipHandler {
    registry: Arc<ResourceRegistry>,
}

impl OwnershipHandler {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for OwnershipHandler {
    async fn handle(
        &self,
        _state: &mut WorkerState,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        match envelope.kind {
            EventType::GuildCreate => {
                let ResourceAnnouncement { record, discovery } = envelope.payload()?;
                let id = record.id.clone();
                tracing::debug!(guild_id = %id, listed = discovery.is_some(), "Guild ownership observed");
                self.registry.insert(record);
                if discovery.is_some() {
                    self.registry.set_discoverable(&id, discovery);
                }
            }
            EventType::GuildDelete => {
                let ResourceGone { id } = envelope.payload()?;
                if self.registry.remove(&id).is_none() {
                    tracing::debug!(guild_id = %id, "Delete for unknown guild");
                } else {
                    tracing::debug!(guild_id = %id, "Guild ownership lost");
                }
            }
            other => {
                tracing::warn!(kind = %other, "Ownership handler registered for unexpected event");
            }
        }
        Ok(())
    }
}
