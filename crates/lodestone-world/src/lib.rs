pub mod cache;
pub mod chunk;
pub mod codec;
pub mod level;
pub mod region;
pub mod store;
pub mod transmission;

// Re-export commonly used items
pub use cache::RegionCache;
pub use chunk::{Chunk, SubChunk};
pub use codec::ChunkCodec;
pub use level::LevelData;
pub use region::RegionFile;
pub use store::{ChunkStore, UnloadGuard};
pub use transmission::ChunkSnapshot;
