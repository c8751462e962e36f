use bytes::Bytes;
use deflate::deflate_bytes_zlib;

use crate::model::{Look, Vec3d};
use crate::world::{Chunk, CHUNK_SIZE_X, CHUNK_SIZE_Y, CHUNK_SIZE_Z};

use super::buffer::WriteBuffer;

/// Only this protocol generation is spoken.
pub const PROTOCOL_VERSION: i32 = 2;

/// Entity positions travel as fixed-point "pixels", 32 per block.
pub const PIXELS_PER_BLOCK: f64 = 32.0;

pub const PACKET_KEEP_ALIVE: u8 = 0x00;
pub const PACKET_LOGIN: u8 = 0x01;
pub const PACKET_HANDSHAKE: u8 = 0x02;
pub const PACKET_CHAT_MESSAGE: u8 = 0x03;
pub const PACKET_TIME_UPDATE: u8 = 0x04;
pub const PACKET_PLAYER_INVENTORY: u8 = 0x05;
pub const PACKET_SPAWN_POSITION: u8 = 0x06;
pub const PACKET_FLYING: u8 = 0x0a;
pub const PACKET_PLAYER_POSITION: u8 = 0x0b;
pub const PACKET_PLAYER_LOOK: u8 = 0x0c;
pub const PACKET_PLAYER_POSITION_LOOK: u8 = 0x0d;
pub const PACKET_PLAYER_DIGGING: u8 = 0x0e;
pub const PACKET_PLAYER_BLOCK_PLACEMENT: u8 = 0x0f;
pub const PACKET_HOLDING_CHANGE: u8 = 0x10;
pub const PACKET_ARM_ANIMATION: u8 = 0x12;
pub const PACKET_NAMED_ENTITY_SPAWN: u8 = 0x14;
pub const PACKET_DESTROY_ENTITY: u8 = 0x1d;
pub const PACKET_ENTITY_LOOK: u8 = 0x20;
pub const PACKET_ENTITY_TELEPORT: u8 = 0x22;
pub const PACKET_PRE_CHUNK: u8 = 0x32;
pub const PACKET_MAP_CHUNK: u8 = 0x33;
pub const PACKET_DISCONNECT: u8 = 0xff;

pub const INVENTORY_MAIN: i32 = -1;
pub const INVENTORY_ARMOR: i32 = -2;
pub const INVENTORY_CRAFTING: i32 = -3;

/// Serverbound packets, as produced by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    KeepAlive,
    Login {
        username: String,
        password: String,
    },
    Handshake {
        username: String,
    },
    Chat {
        message: String,
    },
    Flying {
        on_ground: bool,
    },
    PlayerPosition {
        pos: Vec3d,
        stance: f64,
        on_ground: bool,
    },
    PlayerLook {
        look: Look,
        on_ground: bool,
    },
    PlayerPositionLook {
        pos: Vec3d,
        stance: f64,
        look: Look,
        on_ground: bool,
    },
    Digging {
        status: u8,
        x: i32,
        y: u8,
        z: i32,
        face: u8,
    },
    BlockPlacement {
        item: i16,
        x: i32,
        y: u8,
        z: i32,
        direction: u8,
    },
    HoldingChange {
        item: i16,
    },
    ArmAnimation {
        forward: bool,
    },
    Disconnect {
        reason: String,
    },
}

/// Clientbound packets. Each serializes itself through [`WriteBuffer`];
/// multicast paths encode once and fan the resulting `Bytes` out.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    Login {
        entity_id: i32,
    },
    Handshake {
        reply: String,
    },
    Chat {
        message: String,
    },
    TimeUpdate {
        time: i64,
    },
    PlayerInventory {
        kind: i32,
        slots: i16,
    },
    SpawnPosition {
        x: i32,
        y: i32,
        z: i32,
    },
    PlayerPositionLook {
        pos: Vec3d,
        stance: f64,
        look: Look,
        on_ground: bool,
    },
    NamedEntitySpawn {
        entity_id: i32,
        name: String,
        pos: Vec3d,
        look: Look,
        current_item: i16,
    },
    DestroyEntity {
        entity_id: i32,
    },
    EntityLook {
        entity_id: i32,
        look: Look,
    },
    EntityTeleport {
        entity_id: i32,
        pos: Vec3d,
        look: Look,
    },
    PreChunk {
        x: i32,
        z: i32,
        will_send: bool,
    },
    MapChunk {
        x: i32,
        z: i32,
        data: Vec<u8>,
    },
    Disconnect {
        reason: String,
    },
}

pub fn to_pixels(coord: f64) -> i32 {
    (coord * PIXELS_PER_BLOCK).floor() as i32
}

// Angles shrink to one byte: rotation scaled by 256/360, pitch by 64/90,
// both truncated into two's-complement.
pub fn pack_rotation(degrees: f32) -> u8 {
    (degrees * 256.0 / 360.0) as i64 as u8
}

pub fn pack_pitch(degrees: f32) -> u8 {
    (degrees * 64.0 / 90.0) as i64 as u8
}

impl ServerPacket {
    /// The terrain payload is the four block arrays concatenated (blocks,
    /// block data, block light, sky light) and zlib-compressed.
    pub fn map_chunk(chunk: &Chunk) -> ServerPacket {
        let mut raw =
            Vec::with_capacity(chunk.blocks.len() + 3 * chunk.block_data.len());
        raw.extend_from_slice(&chunk.blocks);
        raw.extend_from_slice(&chunk.block_data);
        raw.extend_from_slice(&chunk.block_light);
        raw.extend_from_slice(&chunk.sky_light);

        ServerPacket::MapChunk {
            x: chunk.x * CHUNK_SIZE_X,
            z: chunk.z * CHUNK_SIZE_Z,
            data: deflate_bytes_zlib(&raw),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            ServerPacket::Login { .. } => PACKET_LOGIN,
            ServerPacket::Handshake { .. } => PACKET_HANDSHAKE,
            ServerPacket::Chat { .. } => PACKET_CHAT_MESSAGE,
            ServerPacket::TimeUpdate { .. } => PACKET_TIME_UPDATE,
            ServerPacket::PlayerInventory { .. } => PACKET_PLAYER_INVENTORY,
            ServerPacket::SpawnPosition { .. } => PACKET_SPAWN_POSITION,
            ServerPacket::PlayerPositionLook { .. } => PACKET_PLAYER_POSITION_LOOK,
            ServerPacket::NamedEntitySpawn { .. } => PACKET_NAMED_ENTITY_SPAWN,
            ServerPacket::DestroyEntity { .. } => PACKET_DESTROY_ENTITY,
            ServerPacket::EntityLook { .. } => PACKET_ENTITY_LOOK,
            ServerPacket::EntityTeleport { .. } => PACKET_ENTITY_TELEPORT,
            ServerPacket::PreChunk { .. } => PACKET_PRE_CHUNK,
            ServerPacket::MapChunk { .. } => PACKET_MAP_CHUNK,
            ServerPacket::Disconnect { .. } => PACKET_DISCONNECT,
        }
    }

    pub fn write_to(&self, buf: &mut WriteBuffer) {
        buf.write_u8(self.id());
        match self {
            ServerPacket::Login { entity_id } => {
                buf.write_i32(*entity_id);
                buf.write_str("");
                buf.write_str("");
            }
            ServerPacket::Handshake { reply } => buf.write_str(reply),
            ServerPacket::Chat { message } => buf.write_str(message),
            ServerPacket::TimeUpdate { time } => buf.write_i64(*time),
            ServerPacket::PlayerInventory { kind, slots } => {
                buf.write_i32(*kind);
                buf.write_i16(*slots);
                for _ in 0..*slots {
                    buf.write_i16(-1);
                }
            }
            ServerPacket::SpawnPosition { x, y, z } => {
                buf.write_i32(*x);
                buf.write_i32(*y);
                buf.write_i32(*z);
            }
            ServerPacket::PlayerPositionLook {
                pos,
                stance,
                look,
                on_ground,
            } => {
                buf.write_f64(pos.x);
                buf.write_f64(pos.y);
                buf.write_f64(*stance);
                buf.write_f64(pos.z);
                buf.write_f32(look.rotation);
                buf.write_f32(look.pitch);
                buf.write_bool(*on_ground);
            }
            ServerPacket::NamedEntitySpawn {
                entity_id,
                name,
                pos,
                look,
                current_item,
            } => {
                buf.write_i32(*entity_id);
                buf.write_str(name);
                buf.write_i32(to_pixels(pos.x));
                buf.write_i32(to_pixels(pos.y));
                buf.write_i32(to_pixels(pos.z));
                buf.write_u8(pack_rotation(look.rotation));
                buf.write_u8(pack_pitch(look.pitch));
                buf.write_i16(*current_item);
            }
            ServerPacket::DestroyEntity { entity_id } => buf.write_i32(*entity_id),
            ServerPacket::EntityLook { entity_id, look } => {
                buf.write_i32(*entity_id);
                buf.write_u8(pack_rotation(look.rotation));
                buf.write_u8(pack_pitch(look.pitch));
            }
            ServerPacket::EntityTeleport {
                entity_id,
                pos,
                look,
            } => {
                buf.write_i32(*entity_id);
                buf.write_i32(to_pixels(pos.x));
                buf.write_i32(to_pixels(pos.y));
                buf.write_i32(to_pixels(pos.z));
                buf.write_u8(pack_rotation(look.rotation));
                buf.write_u8(pack_pitch(look.pitch));
            }
            ServerPacket::PreChunk { x, z, will_send } => {
                buf.write_i32(*x);
                buf.write_i32(*z);
                buf.write_bool(*will_send);
            }
            ServerPacket::MapChunk { x, z, data } => {
                buf.write_i32(*x);
                buf.write_i16(0);
                buf.write_i32(*z);
                buf.write_u8((CHUNK_SIZE_X - 1) as u8);
                buf.write_u8((CHUNK_SIZE_Y - 1) as u8);
                buf.write_u8((CHUNK_SIZE_Z - 1) as u8);
                buf.write_i32(data.len() as i32);
                buf.write_bytes(data);
            }
            ServerPacket::Disconnect { reason } => buf.write_str(reason),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::new();
        self.write_to(&mut buf);
        buf.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{BLOCKS_LEN, HEIGHT_MAP_LEN, NIBBLES_LEN};
    use inflate::inflate_bytes_zlib;

    #[test]
    fn handshake_reply_bytes() {
        let bytes = ServerPacket::Handshake {
            reply: "-".to_string(),
        }
        .encode();
        assert_eq!(&bytes[..], [0x02, 0x00, 0x01, b'-']);
    }

    #[test]
    fn login_reply_is_nine_bytes_of_mostly_zero() {
        let bytes = ServerPacket::Login { entity_id: 0 }.encode();
        assert_eq!(&bytes[..], [0x01, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn time_update_bytes() {
        let bytes = ServerPacket::TimeUpdate { time: 20 }.encode();
        assert_eq!(&bytes[..], [0x04, 0, 0, 0, 0, 0, 0, 0, 20]);
    }

    #[test]
    fn pre_chunk_bytes() {
        let bytes = ServerPacket::PreChunk {
            x: -1,
            z: 2,
            will_send: true,
        }
        .encode();
        assert_eq!(
            &bytes[..],
            [0x32, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 2, 0x01]
        );
    }

    #[test]
    fn inventory_block_writes_empty_slots() {
        let bytes = ServerPacket::PlayerInventory {
            kind: INVENTORY_MAIN,
            slots: 36,
        }
        .encode();
        assert_eq!(bytes.len(), 1 + 4 + 2 + 36 * 2);
        assert_eq!(&bytes[1..5], [0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&bytes[5..7], [0, 36]);
        assert!(bytes[7..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn pixel_conversion_floors() {
        assert_eq!(to_pixels(0.0), 0);
        assert_eq!(to_pixels(0.5), 16);
        assert_eq!(to_pixels(64.0), 2048);
        assert_eq!(to_pixels(-0.1), -4);
    }

    #[test]
    fn packed_angles_truncate_twos_complement() {
        assert_eq!(pack_rotation(0.0), 0);
        assert_eq!(pack_rotation(90.0), 64);
        assert_eq!(pack_rotation(180.0), 128);
        assert_eq!(pack_rotation(359.0), 255);
        assert_eq!(pack_rotation(-90.0), 192);
        assert_eq!(pack_pitch(90.0), 64);
        assert_eq!(pack_pitch(-90.0), 192);
        assert_eq!(pack_pitch(45.0), 32);
    }

    #[test]
    fn packed_angles_round_trip_within_scale() {
        for deg in 0..360 {
            let packed = pack_rotation(deg as f32);
            let unpacked = (packed as i8) as f32 * 360.0 / 256.0;
            let diff = (deg as f32 - unpacked).rem_euclid(360.0);
            assert!(diff < 360.0 / 256.0 + 1e-3 || diff > 360.0 - 360.0 / 256.0 - 1e-3);
        }
        for deg in -90..=90 {
            let packed = pack_pitch(deg as f32);
            let unpacked = (packed as i8) as f32 * 90.0 / 64.0;
            assert!((deg as f32 - unpacked).abs() < 90.0 / 64.0 + 1e-3);
        }
    }

    #[test]
    fn map_chunk_payload_inflates_to_ordered_arrays() {
        let chunk = Chunk {
            x: -10,
            z: 3,
            blocks: vec![1; BLOCKS_LEN],
            block_data: vec![2; NIBBLES_LEN],
            sky_light: vec![4; NIBBLES_LEN],
            block_light: vec![3; NIBBLES_LEN],
            height_map: vec![0; HEIGHT_MAP_LEN],
        };
        let packet = ServerPacket::map_chunk(&chunk);
        let (x, z, data) = match &packet {
            ServerPacket::MapChunk { x, z, data } => (*x, *z, data.clone()),
            other => panic!("unexpected packet {:?}", other),
        };
        assert_eq!(x, -160);
        assert_eq!(z, 48);

        let raw = inflate_bytes_zlib(&data).unwrap();
        assert_eq!(raw.len(), BLOCKS_LEN + 3 * NIBBLES_LEN);
        assert!(raw[..BLOCKS_LEN].iter().all(|&b| b == 1));
        let data_seg = &raw[BLOCKS_LEN..BLOCKS_LEN + NIBBLES_LEN];
        assert!(data_seg.iter().all(|&b| b == 2));
        let light_seg = &raw[BLOCKS_LEN + NIBBLES_LEN..BLOCKS_LEN + 2 * NIBBLES_LEN];
        assert!(light_seg.iter().all(|&b| b == 3));
        let sky_seg = &raw[BLOCKS_LEN + 2 * NIBBLES_LEN..];
        assert!(sky_seg.iter().all(|&b| b == 4));

        let bytes = packet.encode();
        assert_eq!(bytes[0], PACKET_MAP_CHUNK);
        assert_eq!(&bytes[1..5], (-160i32).to_be_bytes());
        assert_eq!(&bytes[5..7], [0, 0]);
        assert_eq!(&bytes[7..11], 48i32.to_be_bytes());
        assert_eq!(&bytes[11..14], [15, 127, 15]);
    }

    #[test]
    fn named_entity_spawn_layout() {
        let bytes = ServerPacket::NamedEntitySpawn {
            entity_id: 9,
            name: "zorg".to_string(),
            pos: Vec3d::new(1.0, 64.0, -1.0),
            look: Look {
                rotation: 90.0,
                pitch: -45.0,
            },
            current_item: 3,
        }
        .encode();

        assert_eq!(bytes[0], PACKET_NAMED_ENTITY_SPAWN);
        assert_eq!(&bytes[1..5], 9i32.to_be_bytes());
        assert_eq!(&bytes[5..7], [0, 4]);
        assert_eq!(&bytes[7..11], b"zorg");
        assert_eq!(&bytes[11..15], 32i32.to_be_bytes());
        assert_eq!(&bytes[15..19], 2048i32.to_be_bytes());
        assert_eq!(&bytes[19..23], (-32i32).to_be_bytes());
        assert_eq!(bytes[23], 64);
        assert_eq!(bytes[24], pack_pitch(-45.0));
        assert_eq!(&bytes[25..27], 3i16.to_be_bytes());
    }
}
