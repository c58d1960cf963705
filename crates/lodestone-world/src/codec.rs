use crate::chunk::{Chunk, SubChunk, SUB_CHUNK_COUNT};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lodestone_common::Result;
use lodestone_logger::{log, LogSeverity};
use lodestone_nbt::{NbtFile, Tag};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

const FULL_ID_SIZE: usize = 32768;
const FULL_NIBBLE_SIZE: usize = 16384;

/// Run length of one sub-chunk column within the whole-chunk id array; the
/// stride between consecutive columns is run * 8 sub-chunks.
const ID_RUN: usize = 16;
const NIBBLE_RUN: usize = 8;

/// Pure transform between an in-memory [`Chunk`] and its compressed tagged
/// record. Owns the compression level; everything else is stateless.
pub struct ChunkCodec {
    compression: Compression,
}

impl ChunkCodec {
    pub fn new(level: u32) -> Self {
        ChunkCodec {
            compression: Compression::new(level),
        }
    }

    /// Serializes a chunk into a zlib-compressed tag record ready for a
    /// region file. Write-path failures are hard errors.
    pub fn encode(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        let mut level = BTreeMap::new();
        level.insert("xPos".to_string(), Tag::Int(chunk.x()));
        level.insert("zPos".to_string(), Tag::Int(chunk.z()));

        level.insert("V".to_string(), Tag::Byte(0));
        level.insert("LastUpdate".to_string(), Tag::Long(0));
        level.insert("InhabitedTime".to_string(), Tag::Long(0));
        level.insert(
            "TerrainPopulated".to_string(),
            Tag::Byte(chunk.is_populated() as i8),
        );
        level.insert(
            "LightPopulated".to_string(),
            Tag::Byte(chunk.is_light_populated() as i8),
        );

        level.insert("Blocks".to_string(), Tag::ByteArray(chunk.block_id_array()));
        level.insert("Data".to_string(), Tag::ByteArray(chunk.block_data_array()));
        level.insert("SkyLight".to_string(), Tag::ByteArray(chunk.sky_light_array()));
        level.insert(
            "BlockLight".to_string(),
            Tag::ByteArray(chunk.block_light_array()),
        );

        level.insert(
            "Biomes".to_string(),
            Tag::ByteArray(chunk.biome_id_array().to_vec()),
        );
        level.insert(
            "HeightMap".to_string(),
            Tag::IntArray(chunk.height_map_array().to_vec()),
        );

        // In-game-only entities carry no persistable identity and are not
        // written out.
        let entities: Vec<Tag> = chunk
            .entities()
            .iter()
            .filter(|tag| is_persistable_entity(tag))
            .cloned()
            .collect();
        level.insert("Entities".to_string(), Tag::List(entities));
        level.insert(
            "TileEntities".to_string(),
            Tag::List(chunk.tile_entities().to_vec()),
        );

        let mut root = BTreeMap::new();
        root.insert("Level".to_string(), Tag::Compound(level));

        let mut raw = Vec::new();
        NbtFile::new("".to_string(), Tag::Compound(root)).write(&mut raw)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), self.compression);
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    /// Decodes a compressed record back into a chunk. Corrupt or malformed
    /// records are logged and reported as absent; this never fails hard.
    pub fn decode(&self, payload: &[u8]) -> Option<Chunk> {
        let raw = match decompress(payload) {
            Ok(raw) => raw,
            Err(err) => {
                log(
                    format!("Discarding chunk record with corrupt payload: {}", err),
                    LogSeverity::Warning,
                );
                return None;
            }
        };

        let file = match NbtFile::read(&mut Cursor::new(&raw)) {
            Ok(file) => file,
            Err(err) => {
                log(
                    format!("Discarding unparseable chunk record: {}", err),
                    LogSeverity::Warning,
                );
                return None;
            }
        };

        match tree_to_chunk(&file.root) {
            Some(chunk) => Some(chunk),
            None => {
                log(
                    "Discarding structurally invalid chunk record".to_string(),
                    LogSeverity::Warning,
                );
                None
            }
        }
    }
}

impl Default for ChunkCodec {
    fn default() -> Self {
        // Level 7 balances record size against save latency.
        ChunkCodec::new(7)
    }
}

fn is_persistable_entity(tag: &Tag) -> bool {
    tag.as_compound()
        .map(|compound| compound.contains_key("id"))
        .unwrap_or(false)
}

/// Region records tag their compression method per record; both
/// deflate-family framings are accepted on read.
fn decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    if payload.starts_with(&[0x1f, 0x8b]) {
        GzDecoder::new(payload).read_to_end(&mut raw)?;
    } else {
        ZlibDecoder::new(payload).read_to_end(&mut raw)?;
    }
    Ok(raw)
}

fn tree_to_chunk(root: &Tag) -> Option<Chunk> {
    let level = root.as_compound()?.get("Level")?.as_compound()?;

    let x = level.get("xPos").and_then(Tag::as_i32)?;
    let z = level.get("zPos").and_then(Tag::as_i32)?;

    let full_ids = full_array(level, "Blocks", FULL_ID_SIZE, 0x00)?;
    let full_data = full_array(level, "Data", FULL_NIBBLE_SIZE, 0x00)?;
    // Block light defaults to its own zero buffer, deliberately independent
    // of the Data default.
    let full_block_light = full_array(level, "BlockLight", FULL_NIBBLE_SIZE, 0x00)?;
    let full_sky_light = full_array(level, "SkyLight", FULL_NIBBLE_SIZE, 0xff)?;

    let mut sub_chunks = Vec::with_capacity(SUB_CHUNK_COUNT);
    for sub_y in 0..SUB_CHUNK_COUNT {
        sub_chunks.push(SubChunk::from_arrays(
            column_runs(&full_ids, sub_y, ID_RUN),
            column_runs(&full_data, sub_y, NIBBLE_RUN),
            column_runs(&full_block_light, sub_y, NIBBLE_RUN),
            column_runs(&full_sky_light, sub_y, NIBBLE_RUN),
        ));
    }

    let biomes = resolve_biomes(level);

    let mut height_map = [0i32; 256];
    if let Some(heights) = level.get("HeightMap").and_then(Tag::as_int_array) {
        if heights.len() == 256 {
            height_map.copy_from_slice(heights);
        }
    }

    let entities = compound_list(level, "Entities");
    let tile_entities = compound_list(level, "TileEntities");

    let mut chunk = Chunk::new(x, z, sub_chunks, entities, tile_entities, biomes, height_map);
    chunk.set_populated(
        level
            .get("TerrainPopulated")
            .and_then(Tag::as_i8)
            .unwrap_or(0)
            != 0,
    );
    chunk.set_light_populated(
        level.get("LightPopulated").and_then(Tag::as_i8).unwrap_or(0) != 0,
    );
    // A stored record exists, so the terrain was generated.
    chunk.set_generated(true);
    Some(chunk)
}

/// Reads a whole-chunk byte array field. Absent fields get the documented
/// fill value; a present field with the wrong shape invalidates the record.
fn full_array(
    level: &BTreeMap<String, Tag>,
    name: &str,
    size: usize,
    fill: u8,
) -> Option<Vec<u8>> {
    match level.get(name) {
        None => Some(vec![fill; size]),
        Some(tag) => {
            let bytes = tag.as_byte_array()?;
            if bytes.len() != size {
                return None;
            }
            Some(bytes.to_vec())
        }
    }
}

/// Extracts one sub-chunk's array from a whole-chunk array: the run of
/// `run` bytes starting at `sub_y * run` within each of the 256 column
/// strides. Inverse of the encode interleave.
fn column_runs(full: &[u8], sub_y: usize, run: usize) -> Vec<u8> {
    let stride = run * SUB_CHUNK_COUNT;
    let mut out = Vec::with_capacity(run * 256);
    let mut offset = sub_y * run;
    for _ in 0..256 {
        out.extend_from_slice(&full[offset..offset + run]);
        offset += stride;
    }
    out
}

/// Biome resolution prefers the legacy color-encoded field (biome id in the
/// high byte of each int) over the direct id array; anything else leaves the
/// biomes empty.
fn resolve_biomes(level: &BTreeMap<String, Tag>) -> [u8; 256] {
    let mut biomes = [0u8; 256];
    if let Some(colors) = level.get("BiomeColors").and_then(Tag::as_int_array) {
        if colors.len() == 256 {
            for (slot, &color) in biomes.iter_mut().zip(colors) {
                *slot = ((color >> 24) & 0xff) as u8;
            }
            return biomes;
        }
    }
    if let Some(ids) = level.get("Biomes").and_then(Tag::as_byte_array) {
        if ids.len() == 256 {
            biomes.copy_from_slice(ids);
        }
    }
    biomes
}

fn compound_list(level: &BTreeMap<String, Tag>, name: &str) -> Vec<Tag> {
    level
        .get(name)
        .and_then(Tag::as_list)
        .map(|list| {
            list.iter()
                .filter(|tag| tag.as_compound().is_some())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_chunk(x: i32, z: i32) -> Chunk {
        let mut chunk = Chunk::empty(x, z);
        for bx in 0..16 {
            for bz in 0..16 {
                for by in 0..128 {
                    chunk.set_block_id(bx, by, bz, ((bx * 7 + bz * 13 + by) % 251) as u8);
                    chunk.set_block_data(bx, by, bz, ((bx + bz + by) % 16) as u8);
                    chunk.set_block_light(bx, by, bz, ((bx * 3 + by) % 16) as u8);
                    chunk.set_sky_light(bx, by, bz, ((bz * 5 + by) % 16) as u8);
                }
                chunk.set_biome_id(bx, bz, ((bx * 16 + bz) % 256) as u8);
                chunk.set_height_at(bx, bz, (bx * 16 + bz) as i32 % 128);
            }
        }
        chunk.set_populated(true);
        chunk.set_light_populated(true);
        chunk
    }

    fn compress_tree(root: Tag) -> Vec<u8> {
        let mut raw = Vec::new();
        NbtFile::new("".to_string(), root).write(&mut raw).unwrap();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(7));
        encoder.write_all(&raw).unwrap();
        encoder.finish().unwrap()
    }

    fn minimal_level(extra: impl FnOnce(&mut BTreeMap<String, Tag>)) -> Vec<u8> {
        let mut level = BTreeMap::new();
        level.insert("xPos".to_string(), Tag::Int(0));
        level.insert("zPos".to_string(), Tag::Int(0));
        extra(&mut level);
        let mut root = BTreeMap::new();
        root.insert("Level".to_string(), Tag::Compound(level));
        compress_tree(Tag::Compound(root))
    }

    #[test]
    fn test_round_trip_preserves_all_arrays() {
        let codec = ChunkCodec::default();
        let chunk = patterned_chunk(3, -2);

        let payload = codec.encode(&chunk).unwrap();
        let decoded = codec.decode(&payload).unwrap();

        assert_eq!(decoded.x(), 3);
        assert_eq!(decoded.z(), -2);
        for y in 0..SUB_CHUNK_COUNT {
            assert_eq!(decoded.sub_chunk(y), chunk.sub_chunk(y), "sub-chunk {}", y);
        }
        assert_eq!(decoded.biome_id_array(), chunk.biome_id_array());
        assert_eq!(decoded.height_map_array(), chunk.height_map_array());
        assert!(decoded.is_populated());
        assert!(decoded.is_light_populated());
        assert!(decoded.is_generated());
    }

    #[test]
    fn test_interleave_inverse_is_identity() {
        // Independent of contents: arbitrary bytes through the whole-chunk
        // transform and back must come out untouched.
        let mut chunk = Chunk::empty(0, 0);
        for sub_y in 0..SUB_CHUNK_COUNT {
            let ids: Vec<u8> = (0..4096).map(|i| ((i * 31 + sub_y * 17) % 256) as u8).collect();
            let data: Vec<u8> = (0..2048).map(|i| ((i * 7 + sub_y) % 256) as u8).collect();
            let block_light: Vec<u8> = (0..2048).map(|i| ((i * 11 + sub_y * 3) % 256) as u8).collect();
            let sky_light: Vec<u8> = (0..2048).map(|i| ((i * 13 + sub_y * 5) % 256) as u8).collect();
            *chunk.sub_chunk_mut(sub_y) =
                SubChunk::from_arrays(ids, data, block_light, sky_light);
        }

        let full_ids = chunk.block_id_array();
        let full_data = chunk.block_data_array();
        for sub_y in 0..SUB_CHUNK_COUNT {
            let rebuilt = SubChunk::from_arrays(
                column_runs(&full_ids, sub_y, ID_RUN),
                column_runs(&full_data, sub_y, NIBBLE_RUN),
                column_runs(&chunk.block_light_array(), sub_y, NIBBLE_RUN),
                column_runs(&chunk.sky_light_array(), sub_y, NIBBLE_RUN),
            );
            assert_eq!(&rebuilt, chunk.sub_chunk(sub_y));
        }
    }

    #[test]
    fn test_missing_arrays_get_documented_defaults() {
        let codec = ChunkCodec::default();
        let payload = minimal_level(|_| {});
        let chunk = codec.decode(&payload).unwrap();

        for y in 0..SUB_CHUNK_COUNT {
            let sub = chunk.sub_chunk(y);
            assert_eq!(sub.block_id(0, 0, 0), 0);
            assert_eq!(sub.block_data(8, 8, 8), 0);
            assert_eq!(sub.block_light(15, 15, 15), 0);
            assert_eq!(sub.sky_light(15, 15, 15), 15);
        }
    }

    #[test]
    fn test_missing_block_light_is_zero_even_with_data_present() {
        let codec = ChunkCodec::default();
        let payload = minimal_level(|level| {
            level.insert("Data".to_string(), Tag::ByteArray(vec![0xff; 16384]));
        });
        let chunk = codec.decode(&payload).unwrap();
        assert_eq!(chunk.sub_chunk(0).block_data(0, 0, 0), 15);
        assert_eq!(chunk.sub_chunk(0).block_light(0, 0, 0), 0);
    }

    #[test]
    fn test_wrong_sized_array_invalidates_record() {
        let codec = ChunkCodec::default();
        let payload = minimal_level(|level| {
            level.insert("Blocks".to_string(), Tag::ByteArray(vec![0; 100]));
        });
        assert!(codec.decode(&payload).is_none());
    }

    #[test]
    fn test_missing_level_compound_is_rejected() {
        let codec = ChunkCodec::default();
        let payload = compress_tree(Tag::Compound(BTreeMap::new()));
        assert!(codec.decode(&payload).is_none());

        assert!(codec.decode(b"not even compressed").is_none());
    }

    #[test]
    fn test_legacy_biome_colors_preferred() {
        let codec = ChunkCodec::default();
        let payload = minimal_level(|level| {
            let colors: Vec<i32> = (0..256).map(|i| ((i as u32) << 24 | 0x123456) as i32).collect();
            level.insert("BiomeColors".to_string(), Tag::IntArray(colors));
            level.insert("Biomes".to_string(), Tag::ByteArray(vec![9; 256]));
        });
        let chunk = codec.decode(&payload).unwrap();
        assert_eq!(chunk.biome_id(0, 0), 0);
        assert_eq!(chunk.biome_id(15, 15), 255);
    }

    #[test]
    fn test_transient_entities_skipped_on_encode() {
        let codec = ChunkCodec::default();
        let mut chunk = Chunk::empty(0, 0);

        let mut saved = BTreeMap::new();
        saved.insert("id".to_string(), Tag::String("Zombie".to_string()));
        chunk.add_entity(Tag::Compound(saved.clone()));
        // A player-style payload without an id never reaches disk.
        chunk.add_entity(Tag::Compound(BTreeMap::new()));

        let decoded = codec.decode(&codec.encode(&chunk).unwrap()).unwrap();
        assert_eq!(decoded.entities().len(), 1);
        assert_eq!(decoded.entities()[0], Tag::Compound(saved));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = ChunkCodec::default();
        let chunk = patterned_chunk(1, 1);
        assert_eq!(codec.encode(&chunk).unwrap(), codec.encode(&chunk).unwrap());
    }
}
