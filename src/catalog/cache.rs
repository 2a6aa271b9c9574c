use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::TitleRecord;

/// On-disk catalog cache: one JSON file per title record
pub struct CatalogCache {
    /// Directory holding the record files
    records_dir: PathBuf,
}

impl CatalogCache {
    /// Open the cache under `cache_dir`, creating its directory
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let records_dir = cache_dir.join("catalog");

        if !records_dir.exists() {
            fs::create_dir_all(&records_dir).with_context(|| {
                format!("Failed to create catalog directory: {}", records_dir.display())
            })?;
        }

        Ok(Self { records_dir })
    }

    /// Get the path to a record file
    fn record_path(&self, title_id: &str) -> PathBuf {
        self.records_dir.join(format!("{}.json", encode_file_stem(title_id)))
    }

    /// Load all cached records; unreadable files are skipped
    pub fn load_all(&self) -> Result<Vec<TitleRecord>> {
        info!("Loading catalog cache from {}", self.records_dir.display());

        let entries = fs::read_dir(&self.records_dir).with_context(|| {
            format!("Failed to read catalog directory: {}", self.records_dir.display())
        })?;

        let mut records = Vec::new();

        for entry in entries {
            let path = entry?.path();

            // Skip non-JSON files
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            match Self::load_record_file(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping catalog entry {}: {:#}", path.display(), e),
            }
        }

        info!("Loaded {} cached titles", records.len());
        Ok(records)
    }

    /// Load a record from a file
    fn load_record_file(path: &Path) -> Result<TitleRecord> {
        let json_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

        serde_json::from_str(&json_str)
            .with_context(|| format!("Failed to parse catalog file: {}", path.display()))
    }

    /// Write a record, replacing the previous file atomically
    pub fn save(&self, record: &TitleRecord) -> Result<()> {
        let json_str =
            serde_json::to_string_pretty(record).context("Failed to serialize title record")?;

        let mut file = NamedTempFile::new_in(&self.records_dir)
            .context("Failed to create temporary catalog file")?;
        file.write_all(json_str.as_bytes())?;

        let path = self.record_path(&record.id);
        file.persist(&path)
            .with_context(|| format!("Failed to write catalog file: {}", path.display()))?;

        debug!("Saved catalog entry for {}", record.id);
        Ok(())
    }

    /// Delete the record of a title
    pub fn remove(&self, title_id: &str) -> Result<()> {
        let path = self.record_path(title_id);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove catalog file: {}", path.display())),
        }
    }
}

/// File stem for a title id: ASCII alphanumerics and `-` are kept, every
/// other byte becomes `_xx`
pub(crate) fn encode_file_stem(title_id: &str) -> String {
    let mut stem = String::with_capacity(title_id.len());

    for byte in title_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("_{:02x}", byte));
        }
    }

    stem
}
