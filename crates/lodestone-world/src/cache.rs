use crate::region::{RegionFile, REGION_FILE_EXTENSION};
use lodestone_common::{chunk_hash, Result};
use lodestone_logger::{log, LogSeverity};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;

/// Seconds a region handle may sit untouched before a sweep closes it.
pub const REGION_IDLE_SECONDS: i64 = 300;

/// Keyed set of open region file handles. Handles open lazily on first
/// touch; an external driver decides when to sweep, the cache never
/// schedules itself.
pub struct RegionCache {
    dir: PathBuf,
    regions: HashMap<u64, RegionFile>,
}

impl RegionCache {
    /// `dir` is the world's region directory.
    pub fn new(dir: PathBuf) -> Self {
        RegionCache {
            dir,
            regions: HashMap::new(),
        }
    }

    /// Returns the handle for region (x, z), opening it if needed, and
    /// refreshes its last-used stamp with the caller's clock.
    pub fn get(&mut self, x: i32, z: i32, now: i64) -> Result<&mut RegionFile> {
        let index = chunk_hash(x, z);
        if let Entry::Vacant(entry) = self.regions.entry(index) {
            let path = self
                .dir
                .join(format!("r.{}.{}.{}", x, z, REGION_FILE_EXTENSION));
            entry.insert(RegionFile::open(&path, x, z)?);
        }
        let region = self.regions.get_mut(&index).expect("region just inserted");
        region.last_used = now;
        Ok(region)
    }

    pub fn is_open(&self, x: i32, z: i32) -> bool {
        self.regions.contains_key(&chunk_hash(x, z))
    }

    pub fn open_count(&self) -> usize {
        self.regions.len()
    }

    /// Closes and evicts every handle idle for the threshold or longer.
    pub fn sweep(&mut self, now: i64) {
        let stale: Vec<u64> = self
            .regions
            .iter()
            .filter(|(_, region)| now - region.last_used >= REGION_IDLE_SECONDS)
            .map(|(&index, _)| index)
            .collect();
        for index in stale {
            if let Some(mut region) = self.regions.remove(&index) {
                if let Err(err) = region.close() {
                    log(
                        format!(
                            "Failed to close idle region r.{}.{}: {}",
                            region.x(),
                            region.z(),
                            err
                        ),
                        LogSeverity::Error,
                    );
                }
            }
        }
    }

    /// Closes every open handle. Used at shutdown.
    pub fn close_all(&mut self) {
        for (_, mut region) in self.regions.drain() {
            if let Err(err) = region.close() {
                log(
                    format!(
                        "Failed to close region r.{}.{}: {}",
                        region.x(),
                        region.z(),
                        err
                    ),
                    LogSeverity::Error,
                );
            }
        }
    }
}
