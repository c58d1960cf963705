use lodestone_common::{LodestoneError, Result};
use lodestone_logger::time::unix_timestamp_millis;
use lodestone_nbt::{NbtFile, Tag};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::region::REGION_FILE_EXTENSION;

/// A directory is a loadable world only if the metadata file and the region
/// directory both exist and every region-like file carries the expected
/// extension.
pub fn is_valid(path: &Path) -> bool {
    if !path.join("level.dat").is_file() || !path.join("region").is_dir() {
        return false;
    }
    let entries = match fs::read_dir(path.join("region")) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let extension = Path::new(&name)
            .extension()
            .and_then(|extension| extension.to_str());
        if let Some(extension) = extension {
            if extension.starts_with("mc") && extension != REGION_FILE_EXTENSION {
                return false;
            }
        }
    }
    true
}

/// Creates the world directory tree and writes the initial level.dat.
/// Region files are not created here; they appear lazily on first write.
pub fn generate(path: &Path, name: &str, seed: i64, generator: &str, options: &str) -> Result<()> {
    fs::create_dir_all(path.join("region"))?;

    let mut data = BTreeMap::new();
    data.insert("hardcore".to_string(), Tag::Byte(0));
    data.insert("initialized".to_string(), Tag::Byte(1));
    data.insert("GameType".to_string(), Tag::Int(0));
    data.insert("generatorVersion".to_string(), Tag::Int(1));
    data.insert("SpawnX".to_string(), Tag::Int(128));
    data.insert("SpawnY".to_string(), Tag::Int(70));
    data.insert("SpawnZ".to_string(), Tag::Int(128));
    data.insert("version".to_string(), Tag::Int(19133));
    data.insert("DayTime".to_string(), Tag::Int(0));
    data.insert(
        "LastPlayed".to_string(),
        Tag::Long(unix_timestamp_millis()),
    );
    data.insert("RandomSeed".to_string(), Tag::Long(seed));
    data.insert("SizeOnDisk".to_string(), Tag::Long(0));
    data.insert("Time".to_string(), Tag::Long(0));
    data.insert(
        "generatorName".to_string(),
        Tag::String(generator.to_string()),
    );
    data.insert(
        "generatorOptions".to_string(),
        Tag::String(options.to_string()),
    );
    data.insert("LevelName".to_string(), Tag::String(name.to_string()));
    data.insert("GameRules".to_string(), Tag::Compound(BTreeMap::new()));

    let mut root = BTreeMap::new();
    root.insert("Data".to_string(), Tag::Compound(data));

    let mut file = File::create(path.join("level.dat"))?;
    NbtFile::new("".to_string(), Tag::Compound(root)).write_gzip(&mut file)?;
    Ok(())
}

/// Parsed world metadata. Holds the full Data compound so a save writes
/// back everything it read, known fields or not.
pub struct LevelData {
    path: PathBuf,
    data: BTreeMap<String, Tag>,
    name: String,
    seed: i64,
    generator_name: String,
    generator_options: String,
    spawn: (i32, i32, i32),
}

impl LevelData {
    pub fn load(world_root: &Path) -> Result<Self> {
        let path = world_root.join("level.dat");
        let mut file = File::open(&path)?;
        let nbt = NbtFile::read_gzip(&mut file)?;

        let data = nbt
            .root
            .as_compound()
            .and_then(|root| root.get("Data"))
            .and_then(Tag::as_compound)
            .ok_or_else(|| {
                LodestoneError::FormatError(format!("{}: missing Data compound", path.display()))
            })?
            .clone();

        let name = require_string(&data, "LevelName", &path)?;
        let seed = require_long(&data, "RandomSeed", &path)?;
        let generator_name = require_string(&data, "generatorName", &path)?;
        let generator_options = data
            .get("generatorOptions")
            .and_then(Tag::as_string)
            .cloned()
            .unwrap_or_default();
        let spawn = (
            data.get("SpawnX").and_then(Tag::as_i32).unwrap_or(128),
            data.get("SpawnY").and_then(Tag::as_i32).unwrap_or(70),
            data.get("SpawnZ").and_then(Tag::as_i32).unwrap_or(128),
        );

        Ok(LevelData {
            path,
            data,
            name,
            seed,
            generator_name,
            generator_options,
            spawn,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn generator_name(&self) -> &str {
        &self.generator_name
    }

    pub fn generator_options(&self) -> &str {
        &self.generator_options
    }

    pub fn spawn(&self) -> (i32, i32, i32) {
        self.spawn
    }

    pub fn save(&self) -> Result<()> {
        let mut root = BTreeMap::new();
        root.insert("Data".to_string(), Tag::Compound(self.data.clone()));
        let mut file = File::create(&self.path)?;
        NbtFile::new("".to_string(), Tag::Compound(root)).write_gzip(&mut file)?;
        Ok(())
    }
}

fn require_string(data: &BTreeMap<String, Tag>, field: &str, path: &Path) -> Result<String> {
    data.get(field)
        .and_then(Tag::as_string)
        .cloned()
        .ok_or_else(|| {
            LodestoneError::FormatError(format!(
                "{}: missing or mistyped {} field",
                path.display(),
                field
            ))
        })
}

fn require_long(data: &BTreeMap<String, Tag>, field: &str, path: &Path) -> Result<i64> {
    data.get(field).and_then(Tag::as_i64).ok_or_else(|| {
        LodestoneError::FormatError(format!(
            "{}: missing or mistyped {} field",
            path.display(),
            field
        ))
    })
}
