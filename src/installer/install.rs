use log::{info, warn};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::manifest::{InstallManifest, MANIFEST_FILE_NAME};
use crate::error::InstallError;

/// What gets installed, taken from the content manifest
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub title_id: String,
    pub version: String,
    pub size_bytes: u64,
    /// Name of a non-archive artifact inside the install directory
    pub file_name: String,
    /// Primary executable named by the content service
    pub executable: Option<String>,
}

/// Directory name for a title: the name without characters that are unsafe
/// in paths, or the id when nothing is left
pub fn install_folder_name(title_name: &str, title_id: &str) -> String {
    let cleaned: String = title_name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '\'' | '&'))
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();

    if cleaned.is_empty() {
        title_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    } else {
        cleaned.to_string()
    }
}

/// Place a verified artifact into `install_dir` and write its manifest
///
/// Files are extracted into a staging directory next to `install_dir` that is
/// renamed into place once complete. The manifest is written last.
pub fn install_artifact(
    artifact: &Path,
    install_dir: &Path,
    request: &InstallRequest,
    cancel: &CancellationToken,
) -> Result<InstallManifest, InstallError> {
    let parent = install_dir
        .parent()
        .ok_or_else(|| InstallError::Filesystem("invalid install directory".to_string()))?;
    fs::create_dir_all(parent)?;

    let staging = staging_dir(install_dir);
    if staging.exists() {
        warn!("Removing stale staging directory {}", staging.display());
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let files = match stage(artifact, &staging, request, cancel) {
        Ok(files) => files,
        Err(e) => {
            remove_dir_quietly(&staging);
            return Err(e);
        }
    };

    let primary_executable = match &request.executable {
        Some(executable) if files.iter().any(|f| f == Path::new(executable)) => {
            Some(PathBuf::from(executable))
        }
        Some(executable) => {
            warn!("Executable {} is not part of the artifact", executable);
            detect_primary_executable(&files)
        }
        None => detect_primary_executable(&files),
    };

    if let Err(e) = move_into_place(&staging, install_dir) {
        remove_dir_quietly(&staging);
        return Err(e);
    }

    let manifest = InstallManifest {
        title_id: request.title_id.clone(),
        version: request.version.clone(),
        files,
        primary_executable,
        size_bytes: request.size_bytes,
        installed_at: chrono::Utc::now().to_rfc3339(),
    };

    if let Err(e) = manifest.write(install_dir) {
        remove_dir_quietly(install_dir);
        return Err(e.into());
    }

    info!(
        "Installed {} files of {} into {}",
        manifest.files.len(),
        request.title_id,
        install_dir.display()
    );
    Ok(manifest)
}

fn staging_dir(install_dir: &Path) -> PathBuf {
    let name = install_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    install_dir.with_file_name(format!(".{}.staging", name))
}

fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Whether the artifact starts with the zip local file header
fn is_zip(artifact: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(artifact)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == b"PK\x03\x04"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Fill the staging directory; returns the staged files, relative
fn stage(
    artifact: &Path,
    staging: &Path,
    request: &InstallRequest,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, InstallError> {
    if is_zip(artifact)? {
        return extract_zip(artifact, staging, cancel);
    }

    let relative = PathBuf::from(&request.file_name);
    if !is_safe_relative(&relative) {
        return Err(InstallError::ServiceError(format!(
            "unsafe artifact file name {}",
            request.file_name
        )));
    }

    let target = staging.join(&relative);
    fs::copy(artifact, &target)?;
    set_executable(&target)?;

    Ok(vec![relative])
}

fn extract_zip(
    artifact: &Path,
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, InstallError> {
    let mut archive = zip::ZipArchive::new(File::open(artifact)?)?;
    let mut files = Vec::new();

    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let mut entry = archive.by_index(i)?;
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!("Skipping archive entry with unsafe path: {}", entry.name());
                continue;
            }
        };
        if relative == Path::new(MANIFEST_FILE_NAME) {
            warn!("Skipping archive entry that shadows the install manifest");
            continue;
        }

        let target = staging.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        apply_mode(&target, entry.unix_mode())?;

        files.push(relative);
    }

    Ok(files)
}

fn set_executable(path: &Path) -> io::Result<()> {
    apply_mode(path, Some(0o755))
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

/// Rename the staging directory to its final name
fn move_into_place(staging: &Path, install_dir: &Path) -> Result<(), InstallError> {
    if install_dir.exists() {
        // Only an empty directory may be replaced
        if fs::read_dir(install_dir)?.next().is_some() {
            return Err(InstallError::TargetNotEmpty(install_dir.to_path_buf()));
        }
        fs::remove_dir(install_dir)?;
    }

    fs::rename(staging, install_dir)?;
    Ok(())
}

fn is_safe_relative(path: &Path) -> bool {
    path.components().count() > 0
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Pick the file the launcher starts
///
/// Game binaries and start scripts win over other files; installers,
/// uninstallers and redistributables are never picked. Shallower paths win.
pub fn detect_primary_executable(files: &[PathBuf]) -> Option<PathBuf> {
    let skip = Regex::new(r"(?i)(unins|setup|install|redist|dxwebsetup|crashreport)").ok()?;
    let runnable = Regex::new(r"(?i)\.(exe|sh|x86_64|x86|appimage|bin)$").ok()?;

    files
        .iter()
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default();
            runnable.is_match(&name) && !skip.is_match(&name)
        })
        .min_by_key(|path| (path.components().count(), path.to_string_lossy().len()))
        .cloned()
}

/// Remove an installation: the files listed in its manifest, the manifest,
/// then every directory left empty
pub fn uninstall_dir(install_dir: &Path) -> Result<InstallManifest, InstallError> {
    let manifest = InstallManifest::read(install_dir)?.ok_or(InstallError::NotInstalled)?;

    info!("Uninstalling {} from {}", manifest.title_id, install_dir.display());

    for relative in &manifest.files {
        if !is_safe_relative(relative) {
            warn!("Manifest lists unsafe path {}, leaving it", relative.display());
            continue;
        }
        match fs::remove_file(install_dir.join(relative)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    fs::remove_file(InstallManifest::path_in(install_dir))?;

    // Deepest first; directories that still hold user files stay
    for entry in WalkDir::new(install_dir)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
    {
        let _ = fs::remove_dir(entry.path());
    }

    if install_dir.exists() {
        info!("Kept {}: it contains files not installed by the client", install_dir.display());
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn request(file_name: &str) -> InstallRequest {
        InstallRequest {
            title_id: "title-42".to_string(),
            version: "1.0".to_string(),
            size_bytes: 0,
            file_name: file_name.to_string(),
            executable: None,
        }
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn folder_names_are_filesystem_safe() {
        assert_eq!(install_folder_name("Baldur's Gate: EE", "1"), "Baldur's Gate EE");
        assert_eq!(install_folder_name("../..", "title/42"), "title_42");
        assert_eq!(install_folder_name("  Gothic  ", "1"), "Gothic");
    }

    #[test]
    fn zip_is_extracted_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.part");
        write_zip(
            &artifact,
            &[
                ("game/start.sh", b"#!/bin/sh\n"),
                ("game/unins000.exe", b"MZ"),
                ("game/data/level.pak", b"data"),
            ],
        );

        let install_dir = dir.path().join("games").join("Gothic");
        let manifest = install_artifact(
            &artifact,
            &install_dir,
            &request("a.bin"),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(manifest.files.len(), 3);
        assert_eq!(manifest.primary_executable, Some(PathBuf::from("game/start.sh")));
        assert!(install_dir.join("game/data/level.pak").exists());
        assert_eq!(InstallManifest::read(&install_dir).unwrap(), Some(manifest));
        assert!(!staging_dir(&install_dir).exists());
    }

    #[test]
    fn plain_artifact_is_placed_as_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.part");
        fs::write(&artifact, b"\x7fELF").unwrap();

        let install_dir = dir.path().join("Game");
        let manifest = install_artifact(
            &artifact,
            &install_dir,
            &request("game.x86_64"),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(manifest.files, vec![PathBuf::from("game.x86_64")]);
        assert_eq!(manifest.primary_executable, Some(PathBuf::from("game.x86_64")));
    }

    #[test]
    fn cancelled_extraction_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.part");
        write_zip(&artifact, &[("start.sh", b"#!/bin/sh\n")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let install_dir = dir.path().join("Game");
        let err = install_artifact(&artifact, &install_dir, &request("a"), &cancel).unwrap_err();

        assert_eq!(err, InstallError::Cancelled);
        assert!(!install_dir.exists());
        assert!(!staging_dir(&install_dir).exists());
    }

    #[test]
    fn occupied_target_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.part");
        fs::write(&artifact, b"payload").unwrap();
        let install_dir = dir.path().join("Game");
        fs::create_dir_all(&install_dir).unwrap();
        fs::write(install_dir.join("save.dat"), b"mine").unwrap();

        let err = install_artifact(&artifact, &install_dir, &request("g.sh"), &CancellationToken::new())
            .unwrap_err();

        assert_eq!(err, InstallError::TargetNotEmpty(install_dir.clone()));
        assert_eq!(fs::read(install_dir.join("save.dat")).unwrap(), b"mine");
    }

    #[test]
    fn uninstall_keeps_user_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.part");
        write_zip(&artifact, &[("bin/game.sh", b"x"), ("data/a.pak", b"y")]);
        let install_dir = dir.path().join("Game");
        install_artifact(&artifact, &install_dir, &request("a"), &CancellationToken::new()).unwrap();
        fs::write(install_dir.join("data").join("save.dat"), b"mine").unwrap();

        uninstall_dir(&install_dir).unwrap();

        assert!(!install_dir.join("bin").exists());
        assert!(!install_dir.join("data/a.pak").exists());
        assert!(install_dir.join("data/save.dat").exists());
        assert_eq!(uninstall_dir(&install_dir).unwrap_err(), InstallError::NotInstalled);
    }

    #[test]
    fn installers_are_never_primary() {
        let files = vec![
            PathBuf::from("setup.exe"),
            PathBuf::from("bin/x64/Game.exe"),
            PathBuf::from("readme.txt"),
        ];
        assert_eq!(
            detect_primary_executable(&files),
            Some(PathBuf::from("bin/x64/Game.exe"))
        );
        assert_eq!(detect_primary_executable(&[PathBuf::from("readme.txt")]), None);
    }
}
