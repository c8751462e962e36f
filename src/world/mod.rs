pub mod level;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::model::EntityId;
use crate::nbt::{self, NamedTag, Tag};

pub const CHUNK_SIZE_X: i32 = 16;
pub const CHUNK_SIZE_Y: i32 = 128;
pub const CHUNK_SIZE_Z: i32 = 16;

/// The area within which a client receives world and entity updates.
pub const CHUNK_RADIUS: i32 = 10;

pub const BLOCKS_LEN: usize = (CHUNK_SIZE_X * CHUNK_SIZE_Y * CHUNK_SIZE_Z) as usize;
pub const NIBBLES_LEN: usize = BLOCKS_LEN / 2;
pub const HEIGHT_MAP_LEN: usize = (CHUNK_SIZE_X * CHUNK_SIZE_Z) as usize;

#[derive(Error, Debug)]
pub enum WorldError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("nbt: {0}")]
    Nbt(#[from] nbt::NbtError),
    #[error("missing tag {0}")]
    MissingTag(&'static str),
    #[error("{tag} has length {actual}, expected {expected}")]
    WrongLength {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> ChunkPos {
        ChunkPos { x, z }
    }

    // Truncating division, so block -8.0 still lands in chunk 0. The save
    // format was written against that behavior.
    pub fn from_block_pos(x: f64, z: f64) -> ChunkPos {
        ChunkPos {
            x: (x / CHUNK_SIZE_X as f64) as i32,
            z: (z / CHUNK_SIZE_Z as f64) as i32,
        }
    }
}

/// A 16x128x16 slice of the world held as parallel byte arrays.
pub struct Chunk {
    pub x: i32,
    pub z: i32,
    pub blocks: Vec<u8>,
    pub block_data: Vec<u8>,
    pub sky_light: Vec<u8>,
    pub block_light: Vec<u8>,
    pub height_map: Vec<u8>,
}

impl Chunk {
    pub fn from_nbt(root: &NamedTag) -> Result<Chunk, WorldError> {
        let x = match root.lookup("/Level/xPos") {
            Some(Tag::Int(v)) => *v,
            _ => return Err(WorldError::MissingTag("/Level/xPos")),
        };
        let z = match root.lookup("/Level/zPos") {
            Some(Tag::Int(v)) => *v,
            _ => return Err(WorldError::MissingTag("/Level/zPos")),
        };
        Ok(Chunk {
            x,
            z,
            blocks: byte_array(root, "/Level/Blocks", BLOCKS_LEN)?,
            block_data: byte_array(root, "/Level/Data", NIBBLES_LEN)?,
            sky_light: byte_array(root, "/Level/SkyLight", NIBBLES_LEN)?,
            block_light: byte_array(root, "/Level/BlockLight", NIBBLES_LEN)?,
            height_map: byte_array(root, "/Level/HeightMap", HEIGHT_MAP_LEN)?,
        })
    }
}

fn byte_array(root: &NamedTag, path: &'static str, expected: usize) -> Result<Vec<u8>, WorldError> {
    match root.lookup(path) {
        Some(Tag::ByteArray(data)) => {
            if data.len() != expected {
                return Err(WorldError::WrongLength {
                    tag: path,
                    expected,
                    actual: data.len(),
                });
            }
            Ok(data.clone())
        }
        _ => Err(WorldError::MissingTag(path)),
    }
}

fn base36_encode(n: i32) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = i64::from(n);
    let negative = n < 0;
    if negative {
        n = -n;
    }
    if n == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while n != 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    if negative {
        digits.push(b'-');
    }
    digits.iter().rev().map(|&b| b as char).collect()
}

/// On-disk location of a chunk. The directory components mask the
/// coordinate with 63 over its two's-complement representation, so negative
/// coordinates land in "large" buckets; the save format depends on this
/// exact scheme.
pub fn chunk_file_path(root: &Path, pos: ChunkPos) -> PathBuf {
    root.join(base36_encode(pos.x & 63))
        .join(base36_encode(pos.z & 63))
        .join(format!(
            "c.{}.{}.dat",
            base36_encode(pos.x),
            base36_encode(pos.z)
        ))
}

/// Iterate the square of chunks around `center`, z-major. Order is part of
/// the observable chunk-streaming behavior, so keep it stable.
pub fn chunks_in_radius(center: ChunkPos) -> impl Iterator<Item = ChunkPos> {
    (center.z - CHUNK_RADIUS..=center.z + CHUNK_RADIUS).flat_map(move |z| {
        (center.x - CHUNK_RADIUS..=center.x + CHUNK_RADIUS).map(move |x| ChunkPos::new(x, z))
    })
}

struct Resident {
    chunk: Chunk,
    last_used: u64,
}

/// Lazy chunk cache over the world directory, plus the index of which
/// players currently have each chunk in their area of interest. Owned
/// exclusively by the game task.
pub struct ChunkStore {
    world_root: PathBuf,
    capacity: usize,
    clock: u64,
    chunks: HashMap<ChunkPos, Resident>,
    watchers: HashMap<ChunkPos, HashSet<EntityId>>,
}

impl ChunkStore {
    pub fn new(world_root: PathBuf, capacity: usize) -> ChunkStore {
        ChunkStore {
            world_root,
            capacity,
            clock: 0,
            chunks: HashMap::new(),
            watchers: HashMap::new(),
        }
    }

    /// Fetch a chunk, reading it from disk on a cache miss. Errors are the
    /// caller's problem; one unreadable file must never take the server
    /// down.
    pub fn get(&mut self, pos: ChunkPos) -> Result<&Chunk, WorldError> {
        self.clock += 1;
        let clock = self.clock;

        if let Some(resident) = self.chunks.get_mut(&pos) {
            resident.last_used = clock;
        } else {
            let chunk = load_chunk(&self.world_root, pos)?;
            self.evict_cold();
            self.chunks.insert(
                pos,
                Resident {
                    chunk,
                    last_used: clock,
                },
            );
            debug!("loaded chunk ({}, {})", pos.x, pos.z);
        }
        Ok(&self.chunks[&pos].chunk)
    }

    pub fn resident_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_resident(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn watch(&mut self, pos: ChunkPos, id: EntityId) {
        self.watchers.entry(pos).or_default().insert(id);
    }

    pub fn unwatch(&mut self, pos: ChunkPos, id: EntityId) {
        if let Some(set) = self.watchers.get_mut(&pos) {
            set.remove(&id);
            if set.is_empty() {
                self.watchers.remove(&pos);
            }
        }
    }

    /// Deduplicated union of the watcher sets of every chunk within
    /// `CHUNK_RADIUS` of `center`.
    pub fn players_in_radius(&self, center: ChunkPos) -> HashSet<EntityId> {
        let mut players = HashSet::new();
        for pos in chunks_in_radius(center) {
            if let Some(watchers) = self.watchers.get(&pos) {
                players.extend(watchers);
            }
        }
        players
    }

    // Drop least-recently-used chunks nobody watches until we are back
    // under capacity. Watched chunks are never evicted, so the cache may
    // exceed its bound while players cover it.
    fn evict_cold(&mut self) {
        while self.chunks.len() >= self.capacity {
            let victim = self
                .chunks
                .iter()
                .filter(|(pos, _)| !self.watchers.contains_key(*pos))
                .min_by_key(|(_, resident)| resident.last_used)
                .map(|(pos, _)| *pos);
            match victim {
                Some(pos) => {
                    self.chunks.remove(&pos);
                    debug!("evicted chunk ({}, {})", pos.x, pos.z);
                }
                None => break,
            }
        }
    }
}

fn load_chunk(root: &Path, pos: ChunkPos) -> Result<Chunk, WorldError> {
    let path = chunk_file_path(root, pos);
    let file = File::open(&path)?;
    let tag = nbt::read(BufReader::new(file))?;
    Chunk::from_nbt(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_world() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "alphacraft-world-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_chunk(root: &Path, x: i32, z: i32) {
        let mut level = Map::new();
        level.insert("xPos".to_string(), Tag::Int(x));
        level.insert("zPos".to_string(), Tag::Int(z));
        level.insert("Blocks".to_string(), Tag::ByteArray(vec![0; BLOCKS_LEN]));
        level.insert("Data".to_string(), Tag::ByteArray(vec![0; NIBBLES_LEN]));
        level.insert("SkyLight".to_string(), Tag::ByteArray(vec![0; NIBBLES_LEN]));
        level.insert(
            "BlockLight".to_string(),
            Tag::ByteArray(vec![0; NIBBLES_LEN]),
        );
        level.insert(
            "HeightMap".to_string(),
            Tag::ByteArray(vec![0; HEIGHT_MAP_LEN]),
        );
        let mut root_tags = Map::new();
        root_tags.insert("Level".to_string(), Tag::Compound(level));
        let root_tag = NamedTag {
            name: String::new(),
            tag: Tag::Compound(root_tags),
        };

        let path = chunk_file_path(root, ChunkPos::new(x, z));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        nbt::write(File::create(path).unwrap(), &root_tag).unwrap();
    }

    #[test]
    fn base36_encoding_is_signed() {
        assert_eq!(base36_encode(0), "0");
        assert_eq!(base36_encode(35), "z");
        assert_eq!(base36_encode(36), "10");
        assert_eq!(base36_encode(-1), "-1");
        assert_eq!(base36_encode(-13), "-d");
        assert_eq!(base36_encode(i32::MIN), "-zik0zk");
    }

    #[test]
    fn directory_masking_uses_twos_complement() {
        assert_eq!(-13i32 & 63, 51);
        assert_eq!(base36_encode(-13 & 63), "1f");
        assert_eq!(base36_encode(-35 & 63), "t");
    }

    #[test]
    fn chunk_path_for_negative_coords() {
        let path = chunk_file_path(Path::new("/world"), ChunkPos::new(-13, 7));
        assert_eq!(path, PathBuf::from("/world/1f/7/c.-d.7.dat"));
    }

    #[test]
    fn block_to_chunk_truncates_toward_zero() {
        assert_eq!(ChunkPos::from_block_pos(0.5, 0.5), ChunkPos::new(0, 0));
        assert_eq!(ChunkPos::from_block_pos(16.0, 31.9), ChunkPos::new(1, 1));
        assert_eq!(ChunkPos::from_block_pos(-8.0, -15.9), ChunkPos::new(0, 0));
        assert_eq!(ChunkPos::from_block_pos(-16.5, 0.0), ChunkPos::new(-1, 0));
    }

    #[test]
    fn radius_sweep_is_deterministic_and_square() {
        let sweep: Vec<ChunkPos> = chunks_in_radius(ChunkPos::new(0, 0)).collect();
        let side = (2 * CHUNK_RADIUS + 1) as usize;
        assert_eq!(sweep.len(), side * side);
        assert_eq!(sweep[0], ChunkPos::new(-CHUNK_RADIUS, -CHUNK_RADIUS));
        assert_eq!(
            sweep[side * side - 1],
            ChunkPos::new(CHUNK_RADIUS, CHUNK_RADIUS)
        );
        let again: Vec<ChunkPos> = chunks_in_radius(ChunkPos::new(0, 0)).collect();
        assert_eq!(sweep, again);
    }

    #[test]
    fn get_loads_and_caches() {
        let root = temp_world();
        write_chunk(&root, 3, -2);

        let mut store = ChunkStore::new(root, 16);
        let chunk = store.get(ChunkPos::new(3, -2)).unwrap();
        assert_eq!((chunk.x, chunk.z), (3, -2));
        assert_eq!(chunk.blocks.len(), BLOCKS_LEN);
        assert_eq!(store.resident_chunks(), 1);

        store.get(ChunkPos::new(3, -2)).unwrap();
        assert_eq!(store.resident_chunks(), 1);
    }

    #[test]
    fn missing_chunk_is_an_error_not_a_crash() {
        let root = temp_world();
        let mut store = ChunkStore::new(root, 16);
        assert!(matches!(
            store.get(ChunkPos::new(0, 0)),
            Err(WorldError::Io(_))
        ));
    }

    #[test]
    fn corrupt_chunk_is_an_error() {
        let root = temp_world();
        let path = chunk_file_path(&root, ChunkPos::new(0, 0));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"not a gzip stream").unwrap();

        let mut store = ChunkStore::new(root, 16);
        assert!(matches!(
            store.get(ChunkPos::new(0, 0)),
            Err(WorldError::Nbt(_))
        ));
    }

    #[test]
    fn eviction_prefers_cold_unwatched_chunks() {
        let root = temp_world();
        for x in 0..4 {
            write_chunk(&root, x, 0);
        }

        let mut store = ChunkStore::new(root, 2);
        store.get(ChunkPos::new(0, 0)).unwrap();
        store.get(ChunkPos::new(1, 0)).unwrap();
        store.get(ChunkPos::new(2, 0)).unwrap();
        // (0, 0) was the least recently used and nobody watched it.
        assert!(!store.is_resident(ChunkPos::new(0, 0)));
        assert_eq!(store.resident_chunks(), 2);

        // Watched chunks survive even over capacity.
        store.watch(ChunkPos::new(1, 0), 7);
        store.watch(ChunkPos::new(2, 0), 7);
        store.get(ChunkPos::new(3, 0)).unwrap();
        assert!(store.is_resident(ChunkPos::new(1, 0)));
        assert!(store.is_resident(ChunkPos::new(2, 0)));
        assert_eq!(store.resident_chunks(), 3);
    }

    #[test]
    fn players_in_radius_deduplicates() {
        let mut store = ChunkStore::new(PathBuf::from("unused"), 16);
        store.watch(ChunkPos::new(0, 0), 1);
        store.watch(ChunkPos::new(1, 0), 1);
        store.watch(ChunkPos::new(0, 1), 2);

        let players = store.players_in_radius(ChunkPos::new(0, 0));
        assert_eq!(players.len(), 2);
        assert!(players.contains(&1));
        assert!(players.contains(&2));

        // Out of radius.
        let far = store.players_in_radius(ChunkPos::new(100, 100));
        assert!(far.is_empty());
    }

    #[test]
    fn unwatch_clears_empty_sets() {
        let mut store = ChunkStore::new(PathBuf::from("unused"), 16);
        store.watch(ChunkPos::new(0, 0), 1);
        store.unwatch(ChunkPos::new(0, 0), 1);
        assert!(store.players_in_radius(ChunkPos::new(0, 0)).is_empty());
    }
}
