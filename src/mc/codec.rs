use std::io;

use bytes::{Buf, BytesMut};
use log::{debug, trace};
use tokio_util::codec::Decoder;

use crate::model::{Look, Vec3d};

use super::buffer::ReadBuffer;
use super::proto::{self, ClientPacket};

/// Connection phase; gates which tags are legal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Handshake,
    Login,
    Play,
}

/// Tag-dispatched framing for the serverbound stream. Packets carry no
/// length prefix, so decoding attempts a full parse and rolls back (by not
/// consuming) whenever the buffer runs short.
pub struct AlphaCodec {
    state: ProtoState,
}

impl AlphaCodec {
    pub fn new() -> AlphaCodec {
        AlphaCodec {
            state: ProtoState::Handshake,
        }
    }

    pub fn advance(&mut self, next: ProtoState) {
        debug!("connection advancing to {:?}", next);
        self.state = next;
    }

    fn decode_packet(&self, tag: u8, buf: &mut ReadBuffer) -> io::Result<ClientPacket> {
        match self.state {
            ProtoState::Handshake => self.decode_handshake(tag, buf),
            ProtoState::Login => self.decode_login(tag, buf),
            ProtoState::Play => self.decode_play(tag, buf),
        }
    }

    fn decode_handshake(&self, tag: u8, buf: &mut ReadBuffer) -> io::Result<ClientPacket> {
        match tag {
            proto::PACKET_HANDSHAKE => Ok(ClientPacket::Handshake {
                username: buf.read_str()?,
            }),
            other => Err(unexpected_tag(other, "handshake")),
        }
    }

    fn decode_login(&self, tag: u8, buf: &mut ReadBuffer) -> io::Result<ClientPacket> {
        match tag {
            proto::PACKET_LOGIN => {
                let version = buf.read_i32()?;
                let username = buf.read_str()?;
                let password = buf.read_str()?;
                if version != proto::PROTOCOL_VERSION {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unsupported protocol version {}", version),
                    ));
                }
                Ok(ClientPacket::Login { username, password })
            }
            other => Err(unexpected_tag(other, "login")),
        }
    }

    fn decode_play(&self, tag: u8, buf: &mut ReadBuffer) -> io::Result<ClientPacket> {
        match tag {
            proto::PACKET_KEEP_ALIVE => Ok(ClientPacket::KeepAlive),
            proto::PACKET_CHAT_MESSAGE => Ok(ClientPacket::Chat {
                message: buf.read_str()?,
            }),
            proto::PACKET_FLYING => Ok(ClientPacket::Flying {
                on_ground: buf.read_bool()?,
            }),
            proto::PACKET_PLAYER_POSITION => {
                let x = buf.read_f64()?;
                let y = buf.read_f64()?;
                let stance = buf.read_f64()?;
                let z = buf.read_f64()?;
                let on_ground = buf.read_bool()?;
                Ok(ClientPacket::PlayerPosition {
                    pos: Vec3d::new(x, y, z),
                    stance,
                    on_ground,
                })
            }
            proto::PACKET_PLAYER_LOOK => {
                let rotation = buf.read_f32()?;
                let pitch = buf.read_f32()?;
                let on_ground = buf.read_bool()?;
                Ok(ClientPacket::PlayerLook {
                    look: Look { rotation, pitch },
                    on_ground,
                })
            }
            proto::PACKET_PLAYER_POSITION_LOOK => {
                let x = buf.read_f64()?;
                let y = buf.read_f64()?;
                let stance = buf.read_f64()?;
                let z = buf.read_f64()?;
                let rotation = buf.read_f32()?;
                let pitch = buf.read_f32()?;
                let on_ground = buf.read_bool()?;
                Ok(ClientPacket::PlayerPositionLook {
                    pos: Vec3d::new(x, y, z),
                    stance,
                    look: Look { rotation, pitch },
                    on_ground,
                })
            }
            proto::PACKET_PLAYER_DIGGING => Ok(ClientPacket::Digging {
                status: buf.read_u8()?,
                x: buf.read_i32()?,
                y: buf.read_u8()?,
                z: buf.read_i32()?,
                face: buf.read_u8()?,
            }),
            proto::PACKET_PLAYER_BLOCK_PLACEMENT => Ok(ClientPacket::BlockPlacement {
                item: buf.read_i16()?,
                x: buf.read_i32()?,
                y: buf.read_u8()?,
                z: buf.read_i32()?,
                direction: buf.read_u8()?,
            }),
            proto::PACKET_HOLDING_CHANGE => {
                let _entity_id = buf.read_i32()?;
                Ok(ClientPacket::HoldingChange {
                    item: buf.read_i16()?,
                })
            }
            proto::PACKET_ARM_ANIMATION => {
                let _entity_id = buf.read_i32()?;
                Ok(ClientPacket::ArmAnimation {
                    forward: buf.read_bool()?,
                })
            }
            proto::PACKET_DISCONNECT => Ok(ClientPacket::Disconnect {
                reason: buf.read_str()?,
            }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unhandled packet type {:#04x}", other),
            )),
        }
    }
}

fn unexpected_tag(tag: u8, phase: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected packet type {:#04x} during {}", tag, phase),
    )
}

impl Decoder for AlphaCodec {
    type Item = ClientPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<ClientPacket>> {
        if src.is_empty() {
            return Ok(None);
        }

        let (packet, consumed) = {
            let mut buf = ReadBuffer::new(&src[..]);
            let tag = buf.read_u8()?;
            match self.decode_packet(tag, &mut buf) {
                Ok(packet) => (packet, buf.position()),
                // A short buffer just means the rest of the packet has not
                // arrived yet.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
        };

        src.advance(consumed);
        trace!("decoded {:?} ({} bytes)", packet, consumed);
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc::buffer::WriteBuffer;

    fn decode(codec: &mut AlphaCodec, raw: &[u8]) -> io::Result<Option<ClientPacket>> {
        let mut src = BytesMut::from(raw);
        codec.decode(&mut src)
    }

    #[test]
    fn handshake_then_login_flow() {
        let mut codec = AlphaCodec::new();

        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_HANDSHAKE);
        raw.write_str("zorg");
        let packet = decode(&mut codec, raw.data()).unwrap().unwrap();
        assert_eq!(
            packet,
            ClientPacket::Handshake {
                username: "zorg".to_string()
            }
        );

        codec.advance(ProtoState::Login);
        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_LOGIN);
        raw.write_i32(proto::PROTOCOL_VERSION);
        raw.write_str("zorg");
        raw.write_str("");
        let packet = decode(&mut codec, raw.data()).unwrap().unwrap();
        assert_eq!(
            packet,
            ClientPacket::Login {
                username: "zorg".to_string(),
                password: String::new()
            }
        );
    }

    #[test]
    fn partial_packet_waits_for_more_bytes() {
        let mut codec = AlphaCodec::new();
        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_HANDSHAKE);
        raw.write_str("zorg");

        let mut src = BytesMut::from(&raw.data()[..3]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        // Nothing consumed while incomplete.
        assert_eq!(src.len(), 3);

        src.extend_from_slice(&raw.data()[3..]);
        assert!(codec.decode(&mut src).unwrap().is_some());
        assert!(src.is_empty());
    }

    #[test]
    fn wrong_protocol_version_is_rejected() {
        let mut codec = AlphaCodec::new();
        codec.advance(ProtoState::Login);
        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_LOGIN);
        raw.write_i32(9);
        raw.write_str("zorg");
        raw.write_str("");
        let err = decode(&mut codec, raw.data()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn out_of_state_tag_is_rejected() {
        let mut codec = AlphaCodec::new();
        // A chat packet during the handshake phase.
        let err = decode(&mut codec, &[proto::PACKET_CHAT_MESSAGE, 0, 1, b'x']).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_play_tag_is_rejected() {
        let mut codec = AlphaCodec::new();
        codec.advance(ProtoState::Play);
        let err = decode(&mut codec, &[0x99]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn player_position_decodes_fields() {
        let mut codec = AlphaCodec::new();
        codec.advance(ProtoState::Play);
        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_PLAYER_POSITION);
        raw.write_f64(1.5);
        raw.write_f64(64.0);
        raw.write_f64(65.62);
        raw.write_f64(-2.5);
        raw.write_bool(true);
        let packet = decode(&mut codec, raw.data()).unwrap().unwrap();
        assert_eq!(
            packet,
            ClientPacket::PlayerPosition {
                pos: Vec3d::new(1.5, 64.0, -2.5),
                stance: 65.62,
                on_ground: true,
            }
        );
    }

    #[test]
    fn holding_change_ignores_entity_id() {
        let mut codec = AlphaCodec::new();
        codec.advance(ProtoState::Play);
        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_HOLDING_CHANGE);
        raw.write_i32(1234);
        raw.write_i16(17);
        let packet = decode(&mut codec, raw.data()).unwrap().unwrap();
        assert_eq!(packet, ClientPacket::HoldingChange { item: 17 });
    }

    #[test]
    fn consecutive_packets_decode_in_order() {
        let mut codec = AlphaCodec::new();
        codec.advance(ProtoState::Play);
        let mut raw = WriteBuffer::new();
        raw.write_u8(proto::PACKET_KEEP_ALIVE);
        raw.write_u8(proto::PACKET_CHAT_MESSAGE);
        raw.write_str("hi");

        let mut src = BytesMut::from(raw.data());
        assert_eq!(
            codec.decode(&mut src).unwrap().unwrap(),
            ClientPacket::KeepAlive
        );
        assert_eq!(
            codec.decode(&mut src).unwrap().unwrap(),
            ClientPacket::Chat {
                message: "hi".to_string()
            }
        );
        assert!(src.is_empty());
    }
}
