use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// File name of the install manifest inside an install directory
pub const MANIFEST_FILE_NAME: &str = ".galaxy-install.json";

/// Record of a completed installation
///
/// Its presence in an install directory is the only evidence that the title
/// is installed there. It is written last, after extraction has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    /// Title the directory belongs to
    pub title_id: String,

    /// Content version that was installed
    pub version: String,

    /// Installed files, relative to the install directory
    pub files: Vec<PathBuf>,

    /// Executable started by the launcher, relative to the install directory
    pub primary_executable: Option<PathBuf>,

    /// Size of the downloaded artifact
    pub size_bytes: u64,

    /// RFC 3339 timestamp of the installation
    pub installed_at: String,
}

impl InstallManifest {
    /// Path of the manifest inside `install_dir`
    pub fn path_in(install_dir: &Path) -> PathBuf {
        install_dir.join(MANIFEST_FILE_NAME)
    }

    /// Read the manifest of `install_dir`; `None` when there is none
    pub fn read(install_dir: &Path) -> io::Result<Option<Self>> {
        let path = Self::path_in(install_dir);

        let json_str = match fs::read_to_string(&path) {
            Ok(json_str) => json_str,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        serde_json::from_str(&json_str)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Like `read`, but treats an unreadable manifest as absent
    pub fn read_lenient(install_dir: &Path) -> Option<Self> {
        match Self::read(install_dir) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(
                    "Ignoring unreadable install manifest in {}: {}",
                    install_dir.display(),
                    e
                );
                None
            }
        }
    }

    /// Atomically write the manifest into `install_dir`
    pub fn write(&self, install_dir: &Path) -> io::Result<()> {
        let json_str = serde_json::to_string_pretty(self)?;

        let mut file = NamedTempFile::new_in(install_dir)?;
        io::Write::write_all(&mut file, json_str.as_bytes())?;
        file.persist(Self::path_in(install_dir)).map_err(|e| e.error)?;

        Ok(())
    }

    /// Absolute path of the primary executable
    pub fn executable_path(&self, install_dir: &Path) -> Option<PathBuf> {
        self.primary_executable
            .as_ref()
            .map(|relative| install_dir.join(relative))
    }

    /// Listed files that no longer exist on disk
    pub fn missing_files(&self, install_dir: &Path) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|relative| !install_dir.join(relative).exists())
            .cloned()
            .collect()
    }
}
