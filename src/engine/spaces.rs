use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid("space name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("space name too long"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Invalid("capacity must be positive"));
    }
    Ok(())
}

impl Engine {
    /// Register a space under a unique name. A space slot and the name are
    /// claimed before the WAL append and released again if the append fails.
    pub async fn register_space(&self, name: String, capacity: u32) -> Result<SpaceId, EngineError> {
        validate_name(&name)?;
        validate_capacity(capacity)?;

        let _gate = self.commit_gate.read().await;
        self.claim_space_slot()?;
        let id = match self.names.entry(name.clone()) {
            Entry::Occupied(_) => {
                self.release_space_slot();
                info!("space registration rejected: name {name:?} taken");
                return Err(EngineError::DuplicateName(name));
            }
            Entry::Vacant(slot) => {
                let id = self.next_space_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(id);
                id
            }
        };

        let event = Event::SpaceRegistered { id, name: name.clone(), capacity };
        if let Err(e) = self.wal_append(&event).await {
            self.names.remove(&name);
            self.release_space_slot();
            return Err(e);
        }
        self.spaces
            .insert(id, Arc::new(RwLock::new(SpaceState::new(id, name.clone(), capacity))));
        info!(space_id = id, capacity, "space {name:?} registered");
        Ok(id)
    }

    pub async fn get_space(&self, id: SpaceId) -> Result<SpaceInfo, EngineError> {
        let rs = self.space_state(&id).ok_or(EngineError::SpaceNotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::SpaceNotFound(id));
        }
        Ok(guard.info())
    }

    /// All spaces, in registration order.
    pub async fn list_spaces(&self) -> Vec<SpaceInfo> {
        let mut spaces = Vec::new();
        for rs in self.space_states() {
            let guard = rs.read().await;
            if !guard.deleted {
                spaces.push(guard.info());
            }
        }
        spaces
    }

    /// Partial update: omitted fields keep their value. Renaming onto a name
    /// owned by another space is refused.
    pub async fn update_space(
        &self,
        id: SpaceId,
        name: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name {
            validate_name(n)?;
        }
        if let Some(c) = capacity {
            validate_capacity(c)?;
        }

        let _gate = self.commit_gate.read().await;
        let rs = self.space_state(&id).ok_or(EngineError::SpaceNotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::SpaceNotFound(id));
        }

        let old_name = guard.name.clone();
        let new_name = name.unwrap_or_else(|| old_name.clone());
        let new_capacity = capacity.unwrap_or(guard.capacity);
        let renamed = new_name != old_name;
        if renamed {
            match self.names.entry(new_name.clone()) {
                Entry::Occupied(_) => return Err(EngineError::DuplicateName(new_name)),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let event = Event::SpaceUpdated { id, name: new_name.clone(), capacity: new_capacity };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if renamed {
                self.names.remove(&new_name);
            }
            return Err(e);
        }
        if renamed {
            self.names.remove_if(&old_name, |_, owner| *owner == id);
        }
        info!(space_id = id, capacity = new_capacity, "space {new_name:?} updated");
        Ok(())
    }

    /// Delete a space together with its reservations.
    pub async fn delete_space(&self, id: SpaceId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self.space_state(&id).ok_or(EngineError::SpaceNotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::SpaceNotFound(id));
        }

        self.wal_append(&Event::SpaceDeleted { id }).await?;
        let cancelled = guard.reservations.len();
        self.drop_space(&mut guard);
        info!(space_id = id, cancelled, "space deleted");
        Ok(())
    }
}
