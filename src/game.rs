use std::collections::{HashMap, HashSet};
use std::io;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};

use crate::mc::buffer::WriteBuffer;
use crate::mc::proto::{self, ServerPacket};
use crate::model::{EntityId, Look, Player, Vec3d};
use crate::world::{self, ChunkPos, ChunkStore};

pub const GAME_QUEUE_CAPACITY: usize = 256;
pub const TX_QUEUE_CAPACITY: usize = 128;

/// World clock advance per one-second tick.
const TICK_TIME_STEP: i64 = 20;

/// Largest plausible single-update displacement, in blocks. Anything
/// bigger is discarded as a teleport attempt.
const MAX_MOVE_PER_UPDATE: f64 = 10.0;

/// Work posted to the game task. Sessions never touch game state directly;
/// they describe what happened and the single game task applies it.
pub enum Command {
    Join {
        name: String,
        tx: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Option<EntityId>>,
    },
    Leave {
        id: EntityId,
        reason: Option<String>,
    },
    Move {
        id: EntityId,
        pos: Vec3d,
        stance: f64,
        on_ground: bool,
    },
    Look {
        id: EntityId,
        look: Look,
    },
    Ground {
        id: EntityId,
        on_ground: bool,
    },
    Chat {
        id: EntityId,
        text: String,
    },
    Hold {
        id: EntityId,
        item: i16,
    },
    Tick,
}

#[derive(Clone)]
pub struct GameHandle {
    tx: mpsc::Sender<Command>,
}

impl GameHandle {
    pub async fn send(&self, command: Command) -> io::Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "game queue closed"))
    }
}

/// The authoritative game state. One task owns it and serializes every
/// mutation, so none of the fields need locks.
pub struct Game {
    store: ChunkStore,
    players: HashMap<EntityId, Player>,
    next_entity_id: EntityId,
    time: i64,
    spawn_position: Vec3d,
    // Receivers whose queue overflowed or closed mid-fanout; reaped after
    // the current command.
    dead: Vec<EntityId>,
}

impl Game {
    fn new(store: ChunkStore, spawn_position: Vec3d) -> Game {
        Game {
            store,
            players: HashMap::new(),
            next_entity_id: 0,
            time: 0,
            spawn_position,
            dead: Vec::new(),
        }
    }

    /// Start the game task and its one-second ticker.
    pub fn spawn(store: ChunkStore, spawn_position: Vec3d) -> GameHandle {
        let (tx, rx) = mpsc::channel(GAME_QUEUE_CAPACITY);
        let handle = GameHandle { tx };

        let ticker = handle.clone();
        tokio::spawn(async move { Self::ticker(ticker).await });
        tokio::spawn(Self::new(store, spawn_position).run(rx));

        handle
    }

    async fn run(mut self, mut queue: mpsc::Receiver<Command>) {
        while let Some(command) = queue.recv().await {
            self.handle(command);
            self.reap();
        }
    }

    async fn ticker(handle: GameHandle) {
        let mut interval = time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            if handle.send(Command::Tick).await.is_err() {
                return;
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join { name, tx, reply } => self.handle_join(name, tx, reply),
            Command::Leave { id, reason } => self.handle_leave(id, reason),
            Command::Move {
                id,
                pos,
                stance,
                on_ground,
            } => self.handle_move(id, pos, stance, on_ground),
            Command::Look { id, look } => self.handle_look(id, look),
            Command::Ground { id, on_ground } => {
                if let Some(player) = self.players.get_mut(&id) {
                    player.on_ground = on_ground;
                }
            }
            Command::Chat { id, text } => self.handle_chat(id, text),
            Command::Hold { id, item } => {
                if let Some(player) = self.players.get_mut(&id) {
                    player.current_item = item;
                }
            }
            Command::Tick => self.tick(),
        }
    }

    fn tick(&mut self) {
        self.time += TICK_TIME_STEP;
        let packet = ServerPacket::TimeUpdate { time: self.time }.encode();
        self.broadcast(&packet, None);
    }

    fn handle_join(
        &mut self,
        name: String,
        tx: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Option<EntityId>>,
    ) {
        let id = match self.allocate_entity_id() {
            Some(id) => id,
            None => {
                error!("entity id space exhausted");
                let _ = reply.send(None);
                return;
            }
        };

        let player = Player::new(id, name, self.spawn_position, tx);
        let center = player.chunk();

        if let Err(e) = self.watch_area(center, id) {
            warn!("{}: cannot load spawn area: {}", player.name, e);
            let _ = player.transmit(
                ServerPacket::Disconnect {
                    reason: "world data unavailable".to_string(),
                }
                .encode(),
            );
            self.unwatch_area(center, id);
            let _ = reply.send(None);
            return;
        }

        let name = player.name.clone();
        self.players.insert(id, player);

        // Announce the newcomer to everyone already in range.
        let spawn = Self::named_entity_spawn(&self.players[&id]).encode();
        self.multicast(center, &spawn, Some(id));

        // And every existing neighbor to the newcomer, as one slice.
        let mut buf = WriteBuffer::new();
        for other in self.store.players_in_radius(center) {
            if other == id {
                continue;
            }
            if let Some(neighbor) = self.players.get(&other) {
                Self::named_entity_spawn(neighbor).write_to(&mut buf);
            }
        }
        if !buf.is_empty() {
            self.deliver(id, buf.into_bytes());
        }

        info!("{} has joined (entity {})", name, id);
        self.broadcast_chat(format!("{} has joined", name));

        match self.post_login_buffer(id) {
            Ok(bytes) => self.deliver(id, bytes),
            Err(e) => {
                warn!("{}: cannot stream spawn terrain: {}", name, e);
                self.dead.push(id);
            }
        }

        let _ = reply.send(Some(id));
    }

    // Terrain for the whole area in two sweeps, then spawn point, the three
    // empty inventory blocks, and the authoritative position, all as a
    // single transmit slice.
    fn post_login_buffer(&mut self, id: EntityId) -> Result<Bytes, world::WorldError> {
        let (pos, stance, look) = match self.players.get(&id) {
            Some(p) => (p.position, p.stance, p.look),
            None => return Ok(Bytes::new()),
        };
        let center = ChunkPos::from_block_pos(pos.x, pos.z);

        let mut buf = WriteBuffer::new();
        for c in world::chunks_in_radius(center) {
            ServerPacket::PreChunk {
                x: c.x,
                z: c.z,
                will_send: true,
            }
            .write_to(&mut buf);
        }
        for c in world::chunks_in_radius(center) {
            let chunk = self.store.get(c)?;
            ServerPacket::map_chunk(chunk).write_to(&mut buf);
        }

        ServerPacket::SpawnPosition {
            x: pos.x as i32,
            y: pos.y as i32,
            z: pos.z as i32,
        }
        .write_to(&mut buf);

        for (kind, slots) in [
            (proto::INVENTORY_MAIN, 36),
            (proto::INVENTORY_ARMOR, 4),
            (proto::INVENTORY_CRAFTING, 4),
        ] {
            ServerPacket::PlayerInventory { kind, slots }.write_to(&mut buf);
        }

        ServerPacket::PlayerPositionLook {
            pos,
            stance,
            look,
            on_ground: false,
        }
        .write_to(&mut buf);

        Ok(buf.into_bytes())
    }

    fn handle_leave(&mut self, id: EntityId, reason: Option<String>) {
        if let Some(reason) = reason {
            info!("entity {} disconnected: {}", id, reason);
        }
        self.remove_player(id);
    }

    fn remove_player(&mut self, id: EntityId) {
        let Some(player) = self.players.remove(&id) else {
            return;
        };
        let center = player.chunk();

        let destroy = ServerPacket::DestroyEntity { entity_id: id }.encode();
        self.multicast(center, &destroy, Some(id));
        self.unwatch_area(center, id);

        info!("{} has left", player.name);
        self.broadcast_chat(format!("{} has left", player.name));
        // Dropping the player closes its transmit queue; the transmit task
        // drains what is left and shuts the socket down.
    }

    fn handle_move(&mut self, id: EntityId, pos: Vec3d, stance: f64, on_ground: bool) {
        let Some(player) = self.players.get_mut(&id) else {
            return;
        };

        let old = player.position;
        let dist_sq = old.distance_sq(&pos);
        if dist_sq > MAX_MOVE_PER_UPDATE * MAX_MOVE_PER_UPDATE {
            warn!(
                "{} moved {:.1} blocks in one update, discarding",
                player.name,
                dist_sq.sqrt()
            );
            return;
        }

        player.position = pos;
        player.stance = stance;
        player.on_ground = on_ground;
        let look = player.look;

        let old_chunk = ChunkPos::from_block_pos(old.x, old.z);
        let new_chunk = ChunkPos::from_block_pos(pos.x, pos.z);
        if old_chunk != new_chunk {
            self.cross_chunks(id, old_chunk, new_chunk);
        }

        let packet = ServerPacket::EntityTeleport {
            entity_id: id,
            pos,
            look,
        }
        .encode();
        self.multicast(new_chunk, &packet, Some(id));
    }

    // The player stepped over a chunk boundary: shift its area of interest,
    // stream the terrain delta, and exchange spawn/destroy packets with
    // players whose visibility changed.
    fn cross_chunks(&mut self, id: EntityId, from: ChunkPos, to: ChunkPos) {
        let visible_before = self.store.players_in_radius(from);

        let old_area: HashSet<ChunkPos> = world::chunks_in_radius(from).collect();
        let new_area: HashSet<ChunkPos> = world::chunks_in_radius(to).collect();

        let mut buf = WriteBuffer::new();
        for c in world::chunks_in_radius(from) {
            if new_area.contains(&c) {
                continue;
            }
            self.store.unwatch(c, id);
            ServerPacket::PreChunk {
                x: c.x,
                z: c.z,
                will_send: false,
            }
            .write_to(&mut buf);
        }
        for c in world::chunks_in_radius(to) {
            if old_area.contains(&c) {
                continue;
            }
            match self.store.get(c) {
                Ok(chunk) => {
                    ServerPacket::PreChunk {
                        x: c.x,
                        z: c.z,
                        will_send: true,
                    }
                    .write_to(&mut buf);
                    ServerPacket::map_chunk(chunk).write_to(&mut buf);
                }
                Err(e) => {
                    warn!("entity {}: cannot load chunk ({}, {}): {}", id, c.x, c.z, e);
                    self.dead.push(id);
                    return;
                }
            }
            self.store.watch(c, id);
        }
        self.deliver(id, buf.into_bytes());

        let visible_after = self.store.players_in_radius(to);
        let my_spawn = match self.players.get(&id) {
            Some(p) => Self::named_entity_spawn(p).encode(),
            None => return,
        };
        let my_destroy = ServerPacket::DestroyEntity { entity_id: id }.encode();

        let appeared: Vec<EntityId> = visible_after
            .difference(&visible_before)
            .copied()
            .filter(|&other| other != id)
            .collect();
        let vanished: Vec<EntityId> = visible_before
            .difference(&visible_after)
            .copied()
            .filter(|&other| other != id)
            .collect();

        for other in appeared {
            let their_spawn = match self.players.get(&other) {
                Some(p) => Self::named_entity_spawn(p).encode(),
                None => continue,
            };
            self.deliver(id, their_spawn);
            self.deliver(other, my_spawn.clone());
        }
        for other in vanished {
            self.deliver(
                id,
                ServerPacket::DestroyEntity { entity_id: other }.encode(),
            );
            self.deliver(other, my_destroy.clone());
        }
    }

    fn handle_look(&mut self, id: EntityId, look: Look) {
        let Some(player) = self.players.get_mut(&id) else {
            return;
        };
        player.look = look;
        let center = player.chunk();

        let packet = ServerPacket::EntityLook {
            entity_id: id,
            look,
        }
        .encode();
        self.multicast(center, &packet, Some(id));
    }

    fn handle_chat(&mut self, id: EntityId, text: String) {
        let Some(player) = self.players.get(&id) else {
            return;
        };
        let message = format!("<{}> {}", player.name, text);
        info!("{}", message);
        self.broadcast_chat(message);
    }

    fn broadcast_chat(&mut self, message: String) {
        let packet = ServerPacket::Chat { message }.encode();
        self.broadcast(&packet, None);
    }

    /// Send to every connected player.
    fn broadcast(&mut self, packet: &Bytes, except: Option<EntityId>) {
        for (&id, player) in &self.players {
            if Some(id) == except {
                continue;
            }
            if player.transmit(packet.clone()).is_err() {
                self.dead.push(id);
            }
        }
    }

    /// Send to every player whose area of interest covers `center`.
    fn multicast(&mut self, center: ChunkPos, packet: &Bytes, except: Option<EntityId>) {
        for id in self.store.players_in_radius(center) {
            if Some(id) == except {
                continue;
            }
            if let Some(player) = self.players.get(&id) {
                if player.transmit(packet.clone()).is_err() {
                    self.dead.push(id);
                }
            }
        }
    }

    fn deliver(&mut self, id: EntityId, bytes: Bytes) {
        if let Some(player) = self.players.get(&id) {
            if let Err(e) = player.transmit(bytes) {
                debug!("entity {}: transmit queue rejected packet: {}", id, e);
                self.dead.push(id);
            }
        }
    }

    // A full or closed transmit queue converts into a disconnect; a slow
    // client must never stall the game task.
    fn reap(&mut self) {
        while let Some(id) = self.dead.pop() {
            if self.players.contains_key(&id) {
                warn!("disconnecting unresponsive entity {}", id);
                self.remove_player(id);
            }
        }
    }

    fn allocate_entity_id(&mut self) -> Option<EntityId> {
        let start = self.next_entity_id;
        let mut id = start;
        while self.players.contains_key(&id) {
            id = id.wrapping_add(1);
            if id == start {
                return None;
            }
        }
        self.next_entity_id = id.wrapping_add(1);
        Some(id)
    }

    fn watch_area(&mut self, center: ChunkPos, id: EntityId) -> Result<(), world::WorldError> {
        for c in world::chunks_in_radius(center) {
            self.store.get(c)?;
            self.store.watch(c, id);
        }
        Ok(())
    }

    fn unwatch_area(&mut self, center: ChunkPos, id: EntityId) {
        for c in world::chunks_in_radius(center) {
            self.store.unwatch(c, id);
        }
    }

    fn named_entity_spawn(player: &Player) -> ServerPacket {
        ServerPacket::NamedEntitySpawn {
            entity_id: player.id,
            name: player.name.clone(),
            pos: player.position,
            look: player.look,
            current_item: player.current_item,
        }
    }
}
