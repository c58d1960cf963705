use lodestone_world::{level, ChunkStore};
use std::path::Path;

pub const SEED: i64 = 12345;
pub const GENERATOR: &str = "flat";
pub const WORLD_NAME: &str = "Integration World";

pub fn generate_world(path: &Path) {
    level::generate(path, WORLD_NAME, SEED, GENERATOR, "").unwrap();
}

pub fn create_world(path: &Path) -> ChunkStore {
    generate_world(path);
    ChunkStore::open(path).unwrap()
}
