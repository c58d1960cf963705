use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lodestone_common::{LodestoneError, Result};
use lodestone_logger::{log, LogSeverity};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/*  Region file layout:

    One file holds up to 1024 chunks (a 32x32 chunk area), allocated in
    4096-byte sectors. The file opens with a 1024-entry allocation table,
    one big-endian u32 per chunk slot indexed by lx + lz*32, packed as
    |offset:3|count:1| — the 3-byte sector offset in the high bytes, the
    1-byte sector count in the low byte. The table is exactly one sector;
    sector 0 is therefore the header and never holds chunk data. An entry
    of zero means the slot is empty.

    A chunk record starts at offset*4096: a 4-byte big-endian length
    (payload bytes + 1), a 1-byte compression method id, then the
    compressed payload, zero-padded to a whole number of sectors.
*/

pub const SECTOR_SIZE: usize = 4096;
pub const TABLE_ENTRIES: usize = 1024;
pub const REGION_FILE_EXTENSION: &str = "mcr";

pub const COMPRESSION_GZIP: u8 = 1;
pub const COMPRESSION_ZLIB: u8 = 2;

/// Largest record the one-byte sector count can describe.
const MAX_RECORD_SECTORS: usize = 255;

pub struct RegionFile {
    file: Option<File>,
    path: PathBuf,
    x: i32,
    z: i32,
    /// Packed allocation entries, offset << 8 | count.
    table: Vec<u32>,
    /// One flag per sector, true while allocated (sector 0 included).
    used: Vec<bool>,
    /// Unix-seconds timestamp of the last cache access, managed by the
    /// region cache.
    pub last_used: i64,
}

impl RegionFile {
    /// Opens or creates the region file for region (x, z). A fresh file
    /// gets an all-zero allocation table. An existing table is validated on
    /// the way in: overlapping or degenerate entries mean the allocation
    /// table is corrupt, which is unrecoverable.
    pub fn open(path: &Path, x: i32, z: i32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let length = file.metadata()?.len();
        let (table, used) = if length < SECTOR_SIZE as u64 {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0u8; SECTOR_SIZE])?;
            file.flush()?;
            (vec![0u32; TABLE_ENTRIES], vec![true])
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut table = Vec::with_capacity(TABLE_ENTRIES);
            for _ in 0..TABLE_ENTRIES {
                table.push(file.read_u32::<BigEndian>()?);
            }
            let used = Self::build_sector_map(&table, path)?;
            (table, used)
        };

        Ok(RegionFile {
            file: Some(file),
            path: path.to_path_buf(),
            x,
            z,
            table,
            used,
            last_used: 0,
        })
    }

    fn build_sector_map(table: &[u32], path: &Path) -> Result<Vec<bool>> {
        let mut used = vec![true]; // header sector
        for (index, &entry) in table.iter().enumerate() {
            if entry == 0 {
                continue;
            }
            let offset = (entry >> 8) as usize;
            let count = (entry & 0xff) as usize;
            if offset == 0 || count == 0 {
                return Err(LodestoneError::FormatError(format!(
                    "{}: degenerate allocation entry at slot {}",
                    path.display(),
                    index
                )));
            }
            if used.len() < offset + count {
                used.resize(offset + count, false);
            }
            for sector in offset..offset + count {
                if used[sector] {
                    return Err(LodestoneError::FormatError(format!(
                        "{}: overlapping allocation at slot {} (sector {})",
                        path.display(),
                        index,
                        sector
                    )));
                }
                used[sector] = true;
            }
        }
        Ok(used)
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("region file used after close")
    }

    fn assert_open(&self) {
        assert!(self.file.is_some(), "region file used after close");
    }

    fn table_index(lx: usize, lz: usize) -> usize {
        assert!(lx < 32 && lz < 32, "local chunk coordinates out of range");
        lx + lz * 32
    }

    pub fn chunk_exists(&self, lx: usize, lz: usize) -> bool {
        self.assert_open();
        self.table[Self::table_index(lx, lz)] != 0
    }

    /// Reads the raw compressed payload of the chunk at (lx, lz), or `None`
    /// when the slot is empty. Corrupt records and read failures are logged
    /// and reported as absent; decompression is the codec's job.
    pub fn read_chunk(&mut self, lx: usize, lz: usize) -> Option<Vec<u8>> {
        self.assert_open();
        let entry = self.table[Self::table_index(lx, lz)];
        if entry == 0 {
            return None;
        }
        let offset = (entry >> 8) as u64;
        let count = (entry & 0xff) as usize;

        match self.read_record(offset, count) {
            Ok(payload) => payload,
            Err(err) => {
                log(
                    format!(
                        "Failed to read chunk ({}, {}) from region r.{}.{}: {}",
                        lx, lz, self.x, self.z, err
                    ),
                    LogSeverity::Error,
                );
                None
            }
        }
    }

    fn read_record(&mut self, offset: u64, count: usize) -> std::io::Result<Option<Vec<u8>>> {
        let file = self.file_mut();
        file.seek(SeekFrom::Start(offset * SECTOR_SIZE as u64))?;
        let length = file.read_u32::<BigEndian>()? as usize;
        if length < 1 || length + 4 > count * SECTOR_SIZE {
            log(
                format!(
                    "Chunk record at sector {} of r.{}.{} has invalid length {}",
                    offset, self.x, self.z, length
                ),
                LogSeverity::Error,
            );
            return Ok(None);
        }

        let file = self.file_mut();
        let method = file.read_u8()?;
        if method != COMPRESSION_GZIP && method != COMPRESSION_ZLIB {
            log(
                format!(
                    "Chunk record at sector {} of r.{}.{} has unknown compression method {}",
                    offset, self.x, self.z, method
                ),
                LogSeverity::Error,
            );
            return Ok(None);
        }

        let mut payload = vec![0u8; length - 1];
        file.read_exact(&mut payload)?;
        Ok(Some(payload))
    }

    /// Writes a compressed chunk payload to slot (lx, lz), reusing the
    /// existing sector run when it is large enough and allocating a new one
    /// (first fit, else append) otherwise. Failures here risk data loss and
    /// always propagate.
    pub fn write_chunk(&mut self, lx: usize, lz: usize, payload: &[u8]) -> Result<()> {
        let index = Self::table_index(lx, lz);
        self.assert_open();

        let needed = (payload.len() + 5 + SECTOR_SIZE - 1) / SECTOR_SIZE;
        if needed > MAX_RECORD_SECTORS {
            return Err(LodestoneError::StorageError(format!(
                "chunk ({}, {}) payload of {} bytes exceeds the maximum record size",
                lx,
                lz,
                payload.len()
            )));
        }

        let entry = self.table[index];
        let old_offset = (entry >> 8) as usize;
        let old_count = (entry & 0xff) as usize;

        let in_place = entry != 0 && old_count >= needed;
        let offset = if in_place {
            old_offset
        } else {
            self.find_free_run(needed)
        };

        self.write_record(offset as u64, needed, payload)?;

        // On-disk record is in place; now retire the old allocation and
        // publish the new table entry.
        if in_place {
            for sector in offset + needed..offset + old_count {
                self.used[sector] = false;
            }
        } else {
            if entry != 0 {
                for sector in old_offset..old_offset + old_count {
                    self.used[sector] = false;
                }
            }
            if self.used.len() < offset + needed {
                self.used.resize(offset + needed, false);
            }
            for sector in offset..offset + needed {
                self.used[sector] = true;
            }
        }

        let packed = ((offset as u32) << 8) | needed as u32;
        self.table[index] = packed;
        let file = self.file_mut();
        file.seek(SeekFrom::Start(index as u64 * 4))?;
        file.write_u32::<BigEndian>(packed)?;
        file.flush()?;
        Ok(())
    }

    fn write_record(&mut self, offset: u64, sectors: usize, payload: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(sectors * SECTOR_SIZE);
        record.write_u32::<BigEndian>(payload.len() as u32 + 1)?;
        record.write_u8(COMPRESSION_ZLIB)?;
        record.extend_from_slice(payload);
        record.resize(sectors * SECTOR_SIZE, 0);

        let file = self.file_mut();
        file.seek(SeekFrom::Start(offset * SECTOR_SIZE as u64))?;
        file.write_all(&record)?;
        Ok(())
    }

    /// First free run of `needed` consecutive sectors, or the end of the
    /// file when no gap is wide enough.
    fn find_free_run(&self, needed: usize) -> usize {
        let mut run_start = 1;
        let mut run_length = 0;
        for sector in 1..self.used.len() {
            if self.used[sector] {
                run_length = 0;
                run_start = sector + 1;
            } else {
                run_length += 1;
                if run_length == needed {
                    return run_start;
                }
            }
        }
        // A trailing free run can extend past the mapped sectors; with no
        // trailing run, append at the end of the file.
        if run_length > 0 {
            run_start
        } else {
            self.used.len()
        }
    }

    /// Makes all writes durable and releases the handle. Any later call on
    /// this instance is a programming error.
    pub fn close(&mut self) -> Result<()> {
        let file = self.file.take().expect("region file closed twice");
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_region(dir: &Path) -> RegionFile {
        RegionFile::open(&dir.join("r.0.0.mcr"), 0, 0).unwrap()
    }

    fn overlapping(a: u32, b: u32) -> bool {
        let (ao, ac) = ((a >> 8) as usize, (a & 0xff) as usize);
        let (bo, bc) = ((b >> 8) as usize, (b & 0xff) as usize);
        ao < bo + bc && bo < ao + ac
    }

    fn assert_no_overlaps(region: &RegionFile) {
        let live: Vec<u32> = region.table.iter().copied().filter(|&e| e != 0).collect();
        for i in 0..live.len() {
            assert!((live[i] >> 8) >= 1, "allocation inside the header");
            for j in i + 1..live.len() {
                assert!(
                    !overlapping(live[i], live[j]),
                    "entries {:#x} and {:#x} overlap",
                    live[i],
                    live[j]
                );
            }
        }
    }

    #[test]
    fn test_fresh_region_has_empty_header() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path());
        assert_eq!(
            std::fs::metadata(region.path()).unwrap().len(),
            SECTOR_SIZE as u64
        );
        for lx in 0..32 {
            for lz in 0..32 {
                assert!(!region.chunk_exists(lx, lz));
            }
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut region = open_region(dir.path());
        let payload = vec![0xabu8; 1000];

        assert!(region.read_chunk(3, 30).is_none());
        region.write_chunk(3, 30, &payload).unwrap();
        assert!(region.chunk_exists(3, 30));
        assert_eq!(region.read_chunk(3, 30).unwrap(), payload);
    }

    #[test]
    fn test_reopen_sees_previous_writes() {
        let dir = tempdir().unwrap();
        let payload = vec![0x11u8; 5000];
        {
            let mut region = open_region(dir.path());
            region.write_chunk(0, 0, &payload).unwrap();
            region.close().unwrap();
        }
        let mut region = open_region(dir.path());
        assert_eq!(region.read_chunk(0, 0).unwrap(), payload);
    }

    #[test]
    fn test_allocations_never_overlap_under_rewrites() {
        let dir = tempdir().unwrap();
        let mut region = open_region(dir.path());

        // Interleave writes of varying sizes, including grow and shrink
        // rewrites of the same slots.
        let sizes = [100usize, 9000, 3000, 17000, 1, 4091, 12000];
        for (i, &size) in sizes.iter().enumerate() {
            region.write_chunk(i, 0, &vec![i as u8; size]).unwrap();
        }
        for (i, &size) in sizes.iter().enumerate().rev() {
            region.write_chunk(i, 0, &vec![0xee; size * 2 + 1]).unwrap();
            assert_no_overlaps(&region);
        }
        for (i, &size) in sizes.iter().enumerate() {
            region.write_chunk(i, 0, &vec![0x55; size / 2 + 1]).unwrap();
            assert_no_overlaps(&region);
        }
        for (i, &size) in sizes.iter().enumerate() {
            assert_eq!(region.read_chunk(i, 0).unwrap(), vec![0x55; size / 2 + 1]);
        }
    }

    #[test]
    fn test_shrinking_rewrite_frees_tail_sectors() {
        let dir = tempdir().unwrap();
        let mut region = open_region(dir.path());

        region.write_chunk(5, 5, &vec![1; 3 * SECTOR_SIZE]).unwrap();
        let entry = region.table[5 + 5 * 32];
        assert_eq!(entry & 0xff, 4);

        region.write_chunk(5, 5, &vec![2; 100]).unwrap();
        let entry = region.table[5 + 5 * 32];
        assert_eq!(entry & 0xff, 1);
        // The freed tail is reusable by another slot.
        region.write_chunk(6, 5, &vec![3; SECTOR_SIZE]).unwrap();
        assert_no_overlaps(&region);
    }

    #[test]
    fn test_freed_run_is_reused_first_fit() {
        let dir = tempdir().unwrap();
        let mut region = open_region(dir.path());

        region.write_chunk(0, 0, &vec![1; 100]).unwrap(); // sector 1
        region.write_chunk(1, 0, &vec![2; 100]).unwrap(); // sector 2
        region.write_chunk(2, 0, &vec![3; 100]).unwrap(); // sector 3

        // Grow slot 1 so its old sector frees up.
        region.write_chunk(1, 0, &vec![4; 2 * SECTOR_SIZE]).unwrap();
        assert_no_overlaps(&region);

        // The next single-sector write lands in the gap at sector 2.
        region.write_chunk(3, 0, &vec![5; 100]).unwrap();
        assert_eq!(region.table[3] >> 8, 2);
        assert_no_overlaps(&region);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = tempdir().unwrap();
        let mut region = open_region(dir.path());
        let result = region.write_chunk(0, 0, &vec![0; 256 * SECTOR_SIZE]);
        assert!(matches!(result, Err(LodestoneError::StorageError(_))));
    }

    #[test]
    fn test_corrupt_table_rejected_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.mcr");
        {
            let mut region = RegionFile::open(&path, 0, 0).unwrap();
            region.write_chunk(0, 0, &vec![1; 100]).unwrap();
            region.close().unwrap();
        }
        // Point slot 1 at slot 0's sector.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&((1u32 << 8) | 1).to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            RegionFile::open(&path, 0, 0),
            Err(LodestoneError::FormatError(_))
        ));
    }

    #[test]
    fn test_truncated_record_reads_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.mcr");
        {
            let mut region = RegionFile::open(&path, 0, 0).unwrap();
            region.write_chunk(0, 0, &vec![1; 100]).unwrap();
            region.close().unwrap();
        }
        // Blow the record's length prefix past its sector run.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[SECTOR_SIZE..SECTOR_SIZE + 4].copy_from_slice(&(u32::MAX).to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let mut region = RegionFile::open(&path, 0, 0).unwrap();
        assert!(region.read_chunk(0, 0).is_none());
    }

    #[test]
    #[should_panic(expected = "local chunk coordinates out of range")]
    fn test_out_of_range_coordinates_panic() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path());
        region.chunk_exists(32, 0);
    }

    #[test]
    #[should_panic(expected = "used after close")]
    fn test_use_after_close_panics() {
        let dir = tempdir().unwrap();
        let mut region = open_region(dir.path());
        region.close().unwrap();
        region.read_chunk(0, 0);
    }
}
