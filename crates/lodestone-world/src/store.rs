use crate::cache::RegionCache;
use crate::chunk::Chunk;
use crate::codec::ChunkCodec;
use crate::level::{self, LevelData};
use lodestone_common::{ChunkPos, LodestoneError, Result};
use lodestone_logger::time::unix_timestamp;
use lodestone_logger::{log, LogSeverity};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Simulation-side veto on unloading a chunk (player occupancy and the
/// like). Installed by the embedding world; absent means nothing vetoes.
pub trait UnloadGuard {
    fn can_unload(&self, chunk: &Chunk) -> bool;
}

/// Top-level storage orchestrator: owns the resident chunk set and the
/// region handle cache, and moves chunks between memory and disk through
/// the codec. Single-threaded by design; callers own the thread.
pub struct ChunkStore {
    root: PathBuf,
    level: LevelData,
    chunks: HashMap<u64, Chunk>,
    regions: RegionCache,
    codec: ChunkCodec,
    unload_guard: Option<Box<dyn UnloadGuard>>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("root", &self.root)
            .field("resident_chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

impl ChunkStore {
    /// Opens an existing world. The directory is validated as a loadable
    /// world before any chunk I/O happens.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !level::is_valid(&root) {
            return Err(LodestoneError::FormatError(format!(
                "{} is not a loadable world",
                root.display()
            )));
        }
        let level = LevelData::load(&root)?;
        let regions = RegionCache::new(root.join("region"));
        Ok(ChunkStore {
            root,
            level,
            chunks: HashMap::new(),
            regions,
            codec: ChunkCodec::default(),
            unload_guard: None,
        })
    }

    pub fn with_codec(mut self, codec: ChunkCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn set_unload_guard(&mut self, guard: Box<dyn UnloadGuard>) {
        self.unload_guard = Some(guard);
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn level(&self) -> &LevelData {
        &self.level
    }

    pub fn generator_name(&self) -> &str {
        self.level.generator_name()
    }

    pub fn generator_options(&self) -> &str {
        self.level.generator_options()
    }

    /// Returns the resident chunk for (x, z), loading it from storage if
    /// needed. With `create`, a missing or unreadable record yields a fresh
    /// empty chunk instead of `None`.
    pub fn get(&mut self, x: i32, z: i32, create: bool) -> Option<&mut Chunk> {
        let index = ChunkPos::new(x, z).hash();
        if !self.chunks.contains_key(&index) {
            self.load(x, z, create);
        }
        self.chunks.get_mut(&index)
    }

    /// Installs `chunk` as the authoritative instance for (x, z). Any
    /// previously resident instance is dropped unsaved; two live chunks
    /// must never share a coordinate.
    pub fn set(&mut self, x: i32, z: i32, mut chunk: Chunk) {
        chunk.set_position(x, z);
        self.chunks.insert(ChunkPos::new(x, z).hash(), chunk);
    }

    /// Loads (x, z) into the resident set. Returns true iff a chunk is
    /// resident afterwards. Read-side failures (unreadable region, corrupt
    /// record) degrade to "absent" and only fail the load when `create` is
    /// not requested.
    pub fn load(&mut self, x: i32, z: i32, create: bool) -> bool {
        let pos = ChunkPos::new(x, z);
        if self.chunks.contains_key(&pos.hash()) {
            return true;
        }

        let payload = self.read_record(pos);
        let mut chunk = payload.and_then(|payload| self.codec.decode(&payload));
        if chunk.is_none() && create {
            chunk = Some(Chunk::empty(x, z));
        }

        match chunk {
            Some(mut chunk) => {
                chunk.set_position(x, z);
                self.chunks.insert(pos.hash(), chunk);
                true
            }
            None => false,
        }
    }

    fn read_record(&mut self, pos: ChunkPos) -> Option<Vec<u8>> {
        let (rx, rz) = pos.region();
        let (lx, lz) = pos.local();
        match self.regions.get(rx, rz, unix_timestamp()) {
            Ok(region) => region.read_chunk(lx, lz),
            Err(err) => {
                log(
                    format!(
                        "Failed to open region r.{}.{} for chunk ({}, {}): {}",
                        rx, rz, pos.x, pos.z, err
                    ),
                    LogSeverity::Error,
                );
                None
            }
        }
    }

    /// Encodes and writes the resident chunk at (x, z) through its region
    /// file. Returns Ok(false) when no chunk is resident. Write failures
    /// are hard errors; a lost write must never pass silently.
    pub fn save(&mut self, x: i32, z: i32) -> Result<bool> {
        let pos = ChunkPos::new(x, z);
        let payload = match self.chunks.get(&pos.hash()) {
            None => return Ok(false),
            Some(chunk) => self.codec.encode(chunk)?,
        };

        let (rx, rz) = pos.region();
        let (lx, lz) = pos.local();
        let region = self.regions.get(rx, rz, unix_timestamp())?;
        region.write_chunk(lx, lz, &payload)?;
        Ok(true)
    }

    /// Saves every resident chunk, logging and continuing past individual
    /// failures rather than aborting the batch.
    pub fn save_all(&mut self) {
        let coords: Vec<(i32, i32)> = self
            .chunks
            .values()
            .map(|chunk| (chunk.x(), chunk.z()))
            .collect();
        for (x, z) in coords {
            if let Err(err) = self.save(x, z) {
                log(
                    format!("Failed to save chunk ({}, {}): {}", x, z, err),
                    LogSeverity::Error,
                );
            }
        }
    }

    /// Removes (x, z) from the resident set. Does not save; callers needing
    /// durability must save first. With `safe`, the installed guard may
    /// veto the unload.
    pub fn unload(&mut self, x: i32, z: i32, safe: bool) -> bool {
        let index = ChunkPos::new(x, z).hash();
        match self.chunks.get(&index) {
            None => false,
            Some(chunk) => {
                if safe {
                    if let Some(guard) = &self.unload_guard {
                        if !guard.can_unload(chunk) {
                            return false;
                        }
                    }
                }
                self.chunks.remove(&index);
                true
            }
        }
    }

    /// Unloads every resident chunk, ignoring guard vetoes.
    pub fn unload_all(&mut self) {
        self.chunks.clear();
    }

    pub fn is_chunk_loaded(&self, x: i32, z: i32) -> bool {
        self.chunks.contains_key(&ChunkPos::new(x, z).hash())
    }

    pub fn loaded_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Whether (x, z) has a generated record in storage. Loads the chunk as
    /// a side effect, so this is not a pure query.
    pub fn is_generated(&mut self, x: i32, z: i32) -> bool {
        let pos = ChunkPos::new(x, z);
        let (rx, rz) = pos.region();
        let (lx, lz) = pos.local();
        let exists = match self.regions.get(rx, rz, unix_timestamp()) {
            Ok(region) => region.chunk_exists(lx, lz),
            Err(err) => {
                log(
                    format!("Failed to open region r.{}.{}: {}", rx, rz, err),
                    LogSeverity::Error,
                );
                false
            }
        };
        if !exists {
            return false;
        }
        self.get(x, z, true)
            .map(|chunk| chunk.is_generated())
            .unwrap_or(false)
    }

    pub fn is_populated(&mut self, x: i32, z: i32) -> bool {
        self.get(x, z, false)
            .map(|chunk| chunk.is_populated())
            .unwrap_or(false)
    }

    /// Time-based region handle eviction; `now` comes from the driving
    /// tick, the store never schedules itself.
    pub fn gc(&mut self, now: i64) {
        self.regions.sweep(now);
    }

    /// Drops all resident chunks without saving and closes every region
    /// handle.
    pub fn close(&mut self) {
        self.unload_all();
        self.regions.close_all();
    }
}
