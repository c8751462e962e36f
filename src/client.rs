use std::io;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, trace};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;

use crate::game::{Command, GameHandle, TX_QUEUE_CAPACITY};
use crate::mc::codec::{AlphaCodec, ProtoState};
use crate::mc::proto::{ClientPacket, ServerPacket};
use crate::model::EntityId;

/// Greeting sent in the handshake reply; `-` means "no name verification".
const SERVER_GREETING: &str = "-";

/// Drive one client connection to completion. Errors end the connection,
/// never the server.
pub async fn run<R, W>(reader: R, writer: W, game: GameHandle, peer: String)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match handle_connection(reader, writer, game, &peer).await {
        Ok(()) => debug!("{} disconnected", peer),
        Err(e) => debug!("{} dropped: {}", peer, e),
    }
}

async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    game: GameHandle,
    peer: &str,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(reader, AlphaCodec::new());
    let mut writer = writer;

    // NEW -> handshake -> login -> PLAY, all before the player exists.
    let username = match next_packet(&mut frames).await? {
        ClientPacket::Handshake { username } => username,
        _ => return Err(protocol_error("expected handshake")),
    };
    debug!("{} greeted as {:?}", peer, username);
    writer
        .write_all(
            &ServerPacket::Handshake {
                reply: SERVER_GREETING.to_string(),
            }
            .encode(),
        )
        .await?;
    frames.decoder_mut().advance(ProtoState::Login);

    match next_packet(&mut frames).await? {
        ClientPacket::Login { .. } => {}
        _ => return Err(protocol_error("expected login")),
    }
    writer
        .write_all(&ServerPacket::Login { entity_id: 0 }.encode())
        .await?;
    frames.decoder_mut().advance(ProtoState::Play);

    let (tx, rx) = mpsc::channel::<Bytes>(TX_QUEUE_CAPACITY);
    let (reply_tx, reply_rx) = oneshot::channel();
    game.send(Command::Join {
        name: username.clone(),
        tx,
        reply: reply_tx,
    })
    .await?;

    // The transmit task outlives this function; it drains until the game
    // drops the queue's send side, then shuts the socket down.
    tokio::spawn(transmit_loop(rx, writer, peer.to_string()));

    let id = match reply_rx.await {
        Ok(Some(id)) => id,
        Ok(None) => return Ok(()),
        Err(_) => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "game stopped")),
    };
    info!("{} logged in as {} (entity {})", peer, username, id);

    receive_loop(&mut frames, &game, id).await
}

/// Decode packets and post the matching commands until the stream ends.
/// Every exit path tells the game the player is gone.
async fn receive_loop<R>(
    frames: &mut FramedRead<R, AlphaCodec>,
    game: &GameHandle,
    id: EntityId,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let packet = match frames.next().await {
            None => {
                game.send(Command::Leave { id, reason: None }).await?;
                return Ok(());
            }
            Some(Err(e)) => {
                let _ = game.send(Command::Leave { id, reason: None }).await;
                return Err(e);
            }
            Some(Ok(packet)) => packet,
        };
        trace!("entity {} sent {:?}", id, packet);

        if let ClientPacket::Disconnect { reason } = packet {
            game.send(Command::Leave {
                id,
                reason: Some(reason),
            })
            .await?;
            return Ok(());
        }
        for command in commands(id, packet) {
            game.send(command).await?;
        }
    }
}

// Translate one decoded packet into game commands. Packets about world
// edits are accepted and dropped; the world is read-only here.
fn commands(id: EntityId, packet: ClientPacket) -> Vec<Command> {
    match packet {
        ClientPacket::KeepAlive => Vec::new(),
        ClientPacket::Chat { message } => vec![Command::Chat { id, text: message }],
        ClientPacket::Flying { on_ground } => vec![Command::Ground { id, on_ground }],
        ClientPacket::PlayerPosition {
            pos,
            stance,
            on_ground,
        } => vec![Command::Move {
            id,
            pos,
            stance,
            on_ground,
        }],
        ClientPacket::PlayerLook { look, .. } => vec![Command::Look { id, look }],
        ClientPacket::PlayerPositionLook {
            pos,
            stance,
            look,
            on_ground,
        } => vec![
            Command::Move {
                id,
                pos,
                stance,
                on_ground,
            },
            Command::Look { id, look },
        ],
        ClientPacket::HoldingChange { item } => vec![Command::Hold { id, item }],
        ClientPacket::Digging { .. }
        | ClientPacket::BlockPlacement { .. }
        | ClientPacket::ArmAnimation { .. } => {
            trace!("entity {} world interaction ignored", id);
            Vec::new()
        }
        ClientPacket::Handshake { .. }
        | ClientPacket::Login { .. }
        | ClientPacket::Disconnect { .. } => Vec::new(),
    }
}

/// Drain the outbound queue onto the socket. Each queued slice is written
/// whole, in enqueue order.
async fn transmit_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, peer: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("{}: transmit failed: {}", peer, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn next_packet<R>(frames: &mut FramedRead<R, AlphaCodec>) -> io::Result<ClientPacket>
where
    R: AsyncRead + Unpin,
{
    match frames.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(e),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed during login",
        )),
    }
}

fn protocol_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
