use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use crate::error::InstallError;

/// Compute the hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 1024 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Normalize a manifest checksum: optional `sha256:` prefix, any case
fn normalize_checksum(expected: &str) -> Option<String> {
    let trimmed = expected.trim();
    let digest = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };

    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(digest.to_ascii_lowercase())
}

/// Check a downloaded artifact against the manifest checksum
///
/// On mismatch the artifact is deleted.
pub fn verify_artifact(path: &Path, expected: &str) -> Result<(), InstallError> {
    let expected = match normalize_checksum(expected) {
        Some(expected) => expected,
        None => {
            warn!("Manifest checksum '{}' is not a SHA-256 digest", expected);
            remove_artifact(path);
            return Err(InstallError::ServiceError(
                "content manifest has no usable checksum".to_string(),
            ));
        }
    };

    let actual = sha256_file(path)?;
    if actual != expected {
        warn!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
        remove_artifact(path);
        return Err(InstallError::CorruptArtifact);
    }

    info!("Verified {}", path.display());
    Ok(())
}

fn remove_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove artifact {}: {}", path.display(), e);
        }
    }
}
