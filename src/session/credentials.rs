use log::{info, warn};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::NamedTempFile;

use crate::remote::AuthToken;

/// Persists the opaque session token
pub trait CredentialStore: Send + Sync {
    /// Load the stored token, if any
    fn load(&self) -> io::Result<Option<AuthToken>>;

    /// Replace the stored token
    fn save(&self, token: &AuthToken) -> io::Result<()>;

    /// Remove the stored token
    fn clear(&self) -> io::Result<()>;
}

/// Token stored as a JSON file readable only by the current user
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Create a store backed by `path`
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> io::Result<Option<AuthToken>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json_str = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&json_str) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!("Ignoring unreadable session file {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    fn save(&self, token: &AuthToken) -> io::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) => parent,
            None => return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid session path")),
        };
        fs::create_dir_all(parent)?;

        let json_str = serde_json::to_string_pretty(token)?;

        // Write next to the target, then swap it in
        let mut file = NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut file, json_str.as_bytes())?;
        restrict_permissions(file.path())?;
        file.persist(&self.path).map_err(|e| e.error)?;

        info!("Session saved to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> io::Result<()> {
    Ok(())
}

/// Token kept in memory only
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<AuthToken>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> io::Result<Option<AuthToken>> {
        Ok(self.token.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, token: &AuthToken) -> io::Result<()> {
        *self.token.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        *self.token.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}
