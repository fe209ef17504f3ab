//! Durable storage behind the location cache.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::CacheError;
use crate::ap::ApId;
use crate::models::LocationRecord;

/// Cache file name in the cache directory
const CACHE_FILE: &str = "locations.json";

/// On-disk format version
const FORMAT_VERSION: u32 = 1;

/// Storage contract for the location cache.
///
/// `persist` replaces the whole stored table and must be atomic: after a
/// crash the store holds either the previous table or the new one.
pub trait CacheBackend: Send + Sync {
    fn load(&self) -> Result<Vec<LocationRecord>, CacheError>;

    fn persist(&self, records: &HashMap<ApId, LocationRecord>) -> Result<(), CacheError>;
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    records: Vec<&'a LocationRecord>,
}

#[derive(Deserialize)]
struct CacheFile {
    version: u32,
    records: Vec<LocationRecord>,
}

/// Single JSON document, replaced via write-to-temp and rename.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(cache_dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(cache_dir).map_err(|e| {
            CacheError::persistence(format!("Failed to create cache directory {}", cache_dir.display()), e)
        })?;
        Ok(Self {
            path: cache_dir.join(CACHE_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl CacheBackend for JsonFileBackend {
    fn load(&self) -> Result<Vec<LocationRecord>, CacheError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| CacheError::persistence("Failed to read cache file", e))?;
        let file: CacheFile = serde_json::from_str(&contents)
            .map_err(|e| CacheError::persistence("Failed to parse cache file", e))?;

        if file.version != FORMAT_VERSION {
            return Err(CacheError::persistence(
                "Unsupported cache file",
                format!("version {} (expected {})", file.version, FORMAT_VERSION),
            ));
        }

        debug!(path = %self.path.display(), count = file.records.len(), "Cache file loaded");
        Ok(file.records)
    }

    fn persist(&self, records: &HashMap<ApId, LocationRecord>) -> Result<(), CacheError> {
        let mut sorted: Vec<&LocationRecord> = records.values().collect();
        sorted.sort_by(|a, b| a.ap.cmp(&b.ap));

        let contents = serde_json::to_vec(&CacheFileRef {
            version: FORMAT_VERSION,
            records: sorted,
        })
        .map_err(|e| CacheError::persistence("Failed to serialize cache", e))?;

        let temp = self.temp_path();
        let write_temp = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&contents)?;
            file.sync_all()
        };
        if let Err(e) = write_temp() {
            let _ = fs::remove_file(&temp);
            return Err(CacheError::persistence("Failed to write cache file", e));
        }

        fs::rename(&temp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            CacheError::persistence("Failed to replace cache file", e)
        })
    }
}

/// Non-durable backend that keeps the last persisted table in memory.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<LocationRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<LocationRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<LocationRecord>, CacheError> {
        self.records.lock().map(|r| r.clone()).map_err(|_| CacheError::Lock)
    }

    fn persist(&self, records: &HashMap<ApId, LocationRecord>) -> Result<(), CacheError> {
        let mut stored = self.records.lock().map_err(|_| CacheError::Lock)?;
        *stored = records.values().cloned().collect();
        Ok(())
    }
}
