use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{debug, error, info, warn};
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;

use crate::client;
use crate::config::{LaunchOptions, ServerConfig};
use crate::game::{Game, GameHandle};
use crate::record::{RecordingReader, ReplayReader};
use crate::world::{level, ChunkStore};

pub struct Server {
    listener: TcpListener,
    game: GameHandle,
    options: LaunchOptions,
    connections: AtomicI32,
}

impl Server {
    /// Read the spawn point, start the game task, and bind the listener.
    pub async fn bind(config: &ServerConfig, options: LaunchOptions) -> io::Result<Server> {
        let spawn_position = level::read_spawn_position(&options.world_root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        info!(
            "spawn position is ({:.1}, {:.1}, {:.1})",
            spawn_position.x, spawn_position.y, spawn_position.z
        );

        let store = ChunkStore::new(options.world_root.clone(), config.chunk_cache);
        let game = Game::spawn(store, spawn_position);

        let listener = TcpListener::bind(&config.net_endpoint).await?;
        info!("listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            game,
            options,
            connections: AtomicI32::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever; a failed accept is logged, not fatal.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept: {}", e);
                    continue;
                }
            };
            debug!("client {} connected", addr);

            let index = self.connections.fetch_add(1, Ordering::SeqCst);
            let (read_half, write_half) = stream.into_split();
            let reader = self.wrap_reader(read_half, index);

            let game = self.game.clone();
            tokio::spawn(client::run(reader, write_half, game, addr.to_string()));
        }
    }

    // Interpose the recorder or replayer per the debug flags. The replay
    // file substitutes for the second accepted client's inbound stream.
    fn wrap_reader(
        &self,
        inner: OwnedReadHalf,
        index: i32,
    ) -> Box<dyn AsyncRead + Send + Unpin> {
        if let Some(path) = &self.options.record {
            match File::create(path) {
                Ok(file) => return Box::new(RecordingReader::new(inner, file)),
                Err(e) => error!("cannot open record file {}: {}", path.display(), e),
            }
        }
        if index == 1 {
            if let Some(path) = &self.options.replay {
                match File::open(path) {
                    Ok(file) => return Box::new(ReplayReader::new(file)),
                    Err(e) => error!("cannot open replay file {}: {}", path.display(), e),
                }
            }
        }
        Box::new(inner)
    }
}
