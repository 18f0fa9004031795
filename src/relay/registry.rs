//! Relay instance and room registry

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::common::{new_id, ParticipantId, RelayId, RoomId, SafeMap};
use crate::media::PeerConnectionFactory;
use crate::mesh::{MeshManager, MeshTimings};

use super::participant::Participant;
use super::room::Room;

/// One relay process: its identity, its rooms and its place in the mesh
pub struct Relay {
    id: RelayId,
    rooms: SafeMap<RoomId, Arc<Room>>,
    mesh: Arc<MeshManager>,
    media: Arc<dyn PeerConnectionFactory>,
}

impl Relay {
    pub fn new(media: Arc<dyn PeerConnectionFactory>, timings: MeshTimings) -> Arc<Self> {
        let id = new_id();
        Arc::new_cyclic(|relay| Self {
            id,
            rooms: SafeMap::new(),
            mesh: Arc::new(MeshManager::new(id, relay.clone(), timings)),
            media,
        })
    }

    pub fn id(&self) -> RelayId {
        self.id
    }

    pub fn mesh(&self) -> &Arc<MeshManager> {
        &self.mesh
    }

    pub fn media(&self) -> &Arc<dyn PeerConnectionFactory> {
        &self.media
    }

    /// Start the mesh background loops
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Relay {} starting", self.id);
        self.mesh.start(shutdown)
    }

    /// Look a room up by name, creating an empty one if needed. Creating a
    /// room does not claim it in the mesh.
    pub fn get_or_create_room(self: &Arc<Self>, name: &str) -> Arc<Room> {
        let relay = Arc::downgrade(self);
        self.rooms.with_mut(|rooms| {
            if let Some(room) = rooms.values().find(|room| room.name() == name) {
                return room.clone();
            }
            let room = Arc::new(Room::new(name, relay));
            rooms.insert(room.id(), room.clone());
            info!("Created room {} ({})", name, room.id());
            room
        })
    }

    pub fn get_room_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.find(|_, room| room.name() == name)
    }

    pub fn get_room_by_id(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id)
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.values()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Remove a room nothing holds on to anymore and release its claim
    pub fn delete_room_if_empty(&self, room: &Room) -> bool {
        let removed = self.rooms.with_mut(|rooms| {
            let registered = rooms
                .get(&room.id())
                .is_some_and(|current| std::ptr::eq(current.as_ref(), room));
            if registered && room.is_idle() {
                rooms.remove(&room.id());
                true
            } else {
                false
            }
        });
        if removed {
            info!("Deleted room {}", room.name());
            self.mesh.room_offline(room.name());
        }
        removed
    }

    pub fn get_participant_by_id(&self, id: &ParticipantId) -> Option<Arc<Participant>> {
        self.rooms
            .values()
            .into_iter()
            .find_map(|room| room.participant(id))
    }
}
