use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::world::ChunkPos;

/// Process-unique identifier of a live entity.
pub type EntityId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3d {
    pub fn new(x: f64, y: f64, z: f64) -> Vec3d {
        Vec3d { x, y, z }
    }

    pub fn distance_sq(&self, other: &Vec3d) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

/// Rotation and pitch in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Look {
    pub rotation: f32,
    pub pitch: f32,
}

/// A connected player as the game core sees it. Mutable fields are only
/// touched from the game task; the transmit queue end may be used by anyone
/// holding a reference.
pub struct Player {
    pub id: EntityId,
    pub name: String,
    pub position: Vec3d,
    pub stance: f64,
    pub look: Look,
    pub current_item: i16,
    pub on_ground: bool,
    tx: mpsc::Sender<Bytes>,
}

impl Player {
    pub fn new(id: EntityId, name: String, position: Vec3d, tx: mpsc::Sender<Bytes>) -> Player {
        Player {
            id,
            name,
            position,
            stance: 0.0,
            look: Look::default(),
            current_item: 0,
            on_ground: false,
            tx,
        }
    }

    pub fn chunk(&self) -> ChunkPos {
        ChunkPos::from_block_pos(self.position.x, self.position.z)
    }

    /// Queue a pre-serialized slice for transmission without blocking the
    /// game task. A full or closed queue is the caller's cue to drop the
    /// player.
    pub fn transmit(&self, packet: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.tx.try_send(packet)
    }
}
