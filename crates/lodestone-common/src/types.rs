use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, crate::error::LodestoneError>;

/// Packs a chunk (or region) coordinate pair into a single map key.
/// x occupies the high 32 bits, z is zero-extended into the low 32, so the
/// mapping is a bijection over the full i32 range and distinct coordinates
/// can never collide in a cache.
pub fn chunk_hash(x: i32, z: i32) -> u64 {
    ((x as u64) << 32) | (z as u32 as u64)
}

/// A chunk coordinate in chunk space (block coordinates divided by 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        ChunkPos { x, z }
    }

    pub fn hash(&self) -> u64 {
        chunk_hash(self.x, self.z)
    }

    /// Coordinates of the region file owning this chunk (32x32 chunks per
    /// region, arithmetic shift so negatives land in the right region).
    pub fn region(&self) -> (i32, i32) {
        (self.x >> 5, self.z >> 5)
    }

    /// Position of this chunk within its region, each in [0, 32).
    pub fn local(&self) -> (usize, usize) {
        ((self.x & 31) as usize, (self.z & 31) as usize)
    }
}
