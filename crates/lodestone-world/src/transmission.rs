use crate::chunk::Chunk;
use bytes::{BufMut, BytesMut};
use lodestone_nbt::Tag;

/// A read-only, self-contained copy of everything the outbound chunk
/// payload needs. Captured synchronously on the thread that owns the
/// chunk, so encoding can move to a worker without racing the simulation.
pub struct ChunkSnapshot {
    x: i32,
    z: i32,
    ids: Vec<u8>,
    data: Vec<u8>,
    sky_light: Vec<u8>,
    block_light: Vec<u8>,
    height_map: Vec<i32>,
    biome_colors: Vec<i32>,
    extra_data: Vec<(u32, u16)>,
    tiles: Vec<Tag>,
}

impl ChunkSnapshot {
    pub fn capture(chunk: &Chunk) -> Self {
        ChunkSnapshot {
            x: chunk.x(),
            z: chunk.z(),
            ids: chunk.block_id_array(),
            data: chunk.block_data_array(),
            sky_light: chunk.sky_light_array(),
            block_light: chunk.block_light_array(),
            height_map: chunk.height_map_array().to_vec(),
            biome_colors: chunk.biome_color_array(),
            extra_data: chunk
                .extra_data()
                .iter()
                .map(|(&key, &value)| (key, value))
                .collect(),
            tiles: chunk.tile_entities().to_vec(),
        }
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn z(&self) -> i32 {
        self.z
    }
}

/// Builds the outbound chunk payload. The field order is a wire contract
/// with the transmission layer and must not change: block ids, block data,
/// sky light, block light, heightmap bytes, big-endian biome color ints,
/// the little-endian extra-data section, then the tile payloads.
pub fn encode(snapshot: &ChunkSnapshot) -> Vec<u8> {
    let mut buffer = BytesMut::with_capacity(
        snapshot.ids.len()
            + snapshot.data.len()
            + snapshot.sky_light.len()
            + snapshot.block_light.len()
            + snapshot.height_map.len()
            + snapshot.biome_colors.len() * 4
            + 4
            + snapshot.extra_data.len() * 6,
    );

    buffer.put_slice(&snapshot.ids);
    buffer.put_slice(&snapshot.data);
    buffer.put_slice(&snapshot.sky_light);
    buffer.put_slice(&snapshot.block_light);

    for &height in &snapshot.height_map {
        buffer.put_u8(height as u8);
    }
    for &color in &snapshot.biome_colors {
        buffer.put_i32(color);
    }

    buffer.put_u32_le(snapshot.extra_data.len() as u32);
    for &(key, value) in &snapshot.extra_data {
        buffer.put_u32_le(key);
        buffer.put_u16_le(value);
    }

    for tile in &snapshot.tiles {
        let mut serialized = Vec::new();
        tile.write(&mut serialized, "").unwrap();
        buffer.put_slice(&serialized);
    }

    buffer.to_vec()
}

/// Runs the payload build on the blocking pool. The snapshot moves in by
/// value; nothing here can observe later simulation writes.
pub async fn encode_off_thread(snapshot: ChunkSnapshot) -> Vec<u8> {
    tokio::task::spawn_blocking(move || encode(&snapshot))
        .await
        .expect("transmission encode task panicked")
}
