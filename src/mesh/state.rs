//! Replicated room ownership
//!
//! Maps room names to `{active, owner}`. Deactivated rooms stay as inactive
//! tombstones. Every change of the active flag is returned to the caller as a
//! [`StateTransition`] so the mesh manager can react to it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::{RelayId, SafeMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEntity {
    pub active: bool,
    pub owner: RelayId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransition {
    Activated { room: String, owner: RelayId },
    Deactivated { room: String, owner: RelayId },
}

#[derive(Default)]
pub struct MeshState {
    entities: SafeMap<String, RoomEntity>,
}

impl MeshState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a room active. Only an inactive-to-active change yields a
    /// transition; an already active room just takes the new owner.
    pub fn activate(&self, room: &str, owner: RelayId) -> Option<StateTransition> {
        self.entities.with_mut(|entities| {
            let entity = entities.entry(room.to_string()).or_insert(RoomEntity {
                active: false,
                owner,
            });
            entity.owner = owner;
            if entity.active {
                return None;
            }
            entity.active = true;
            Some(StateTransition::Activated {
                room: room.to_string(),
                owner,
            })
        })
    }

    pub fn deactivate(&self, room: &str) -> Option<StateTransition> {
        self.entities.with_mut(|entities| {
            let entity = entities.get_mut(room)?;
            if !entity.active {
                return None;
            }
            entity.active = false;
            Some(StateTransition::Deactivated {
                room: room.to_string(),
                owner: entity.owner,
            })
        })
    }

    pub fn is_active(&self, room: &str) -> bool {
        self.entities
            .get(&room.to_string())
            .is_some_and(|e| e.active)
    }

    pub fn entity(&self, room: &str) -> Option<RoomEntity> {
        self.entities.get(&room.to_string())
    }

    /// Owner of a room while it is active
    pub fn active_owner(&self, room: &str) -> Option<RelayId> {
        self.entity(room).filter(|e| e.active).map(|e| e.owner)
    }

    pub fn snapshot(&self) -> HashMap<String, RoomEntity> {
        self.entities.snapshot()
    }

    pub fn active_rooms(&self) -> Vec<(String, RelayId)> {
        self.entities
            .snapshot()
            .into_iter()
            .filter(|(_, e)| e.active)
            .map(|(name, e)| (name, e.owner))
            .collect()
    }

    pub fn rooms_owned_by(&self, owner: &RelayId) -> Vec<String> {
        self.active_rooms()
            .into_iter()
            .filter(|(_, o)| o == owner)
            .map(|(name, _)| name)
            .collect()
    }
}
