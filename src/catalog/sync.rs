use anyhow::Result;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{CatalogCache, CatalogDiff, SearchResults, TitleRecord};
use crate::config::SettingsStore;
use crate::error::SyncError;
use crate::installer::manifest::InstallManifest;
use crate::installer::InstallState;
use crate::launcher::{LaunchOption, Runner};
use crate::remote::CatalogService;
use crate::session::SessionManager;

/// Catalog sync engine and read model of the library
pub struct Catalog {
    /// Title records keyed by id
    records: RwLock<HashMap<String, TitleRecord>>,
    /// On-disk copy of the records
    cache: CatalogCache,
    /// Serializes cache writes
    persist_lock: Mutex<()>,
    /// Serializes syncs
    sync_lock: tokio::sync::Mutex<()>,
    session: Arc<SessionManager>,
    remote: Arc<dyn CatalogService>,
    settings: Arc<SettingsStore>,
}

impl Catalog {
    /// Load the cached catalog
    ///
    /// Records left in a job state by a previous run are settled from the
    /// filesystem: installed if their manifest exists, not installed otherwise.
    pub fn open(
        cache: CatalogCache,
        session: Arc<SessionManager>,
        remote: Arc<dyn CatalogService>,
        settings: Arc<SettingsStore>,
    ) -> Result<Self> {
        let mut records = HashMap::new();
        let mut settled = Vec::new();

        for mut record in cache.load_all()? {
            if !matches!(
                record.install_state,
                InstallState::Installed | InstallState::NotInstalled
            ) {
                info!(
                    "Resetting interrupted state '{}' of {}",
                    record.install_state, record.id
                );
                record.install_state = InstallState::NotInstalled;
                settled.push(record.id.clone());
            }
            records.insert(record.id.clone(), record);
        }

        let checked = check_install_paths(recorded_paths(records.values()));
        for record in records.values_mut() {
            if reconcile(record, &checked, &HashMap::new()) {
                settled.push(record.id.clone());
            }
        }

        let catalog = Self {
            records: RwLock::new(records),
            cache,
            persist_lock: Mutex::new(()),
            sync_lock: tokio::sync::Mutex::new(()),
            session,
            remote,
            settings,
        };

        for id in settled {
            catalog.persist(&id);
        }

        Ok(catalog)
    }

    /// Fetch the owned titles and merge them into the catalog
    ///
    /// Local state (install state, install path, launch options) is kept for
    /// titles that are still owned. On failure nothing changes.
    pub async fn sync(&self) -> Result<CatalogDiff, SyncError> {
        let _guard = self.sync_lock.lock().await;

        info!("Synchronizing catalog");

        let remote = &self.remote;
        let titles = self
            .session
            .authorized(|token| async move { remote.list_owned_titles(&token).await })
            .await
            .map_err(|e| {
                warn!("Catalog sync failed: {}", e);
                SyncError::from(e)
            })?;

        // filesystem reads happen before the records are locked
        let found = scan_install_roots(&self.settings.get().install_root_directories);
        let recorded = recorded_paths(self.read().values());
        let checked = check_install_paths(recorded);

        let mut diff = CatalogDiff::default();
        {
            let mut records = self.write();
            let mut seen = HashSet::new();

            for metadata in titles {
                if !seen.insert(metadata.id.clone()) {
                    warn!("Catalog service listed {} twice, keeping the first entry", metadata.id);
                    continue;
                }

                match records.get_mut(&metadata.id) {
                    Some(record) => {
                        let mut changed = false;
                        if record.metadata_differs(&metadata) {
                            record.apply_metadata(metadata);
                            changed = true;
                        }
                        if reconcile(record, &checked, &found) {
                            changed = true;
                        }
                        if changed {
                            diff.changed.push(record.clone());
                        }
                    }
                    None => {
                        let mut record = TitleRecord::from_metadata(metadata);
                        reconcile(&mut record, &checked, &found);
                        diff.added.push(record.clone());
                        records.insert(record.id.clone(), record);
                    }
                }
            }

            for record in records.values() {
                if seen.contains(&record.id) {
                    continue;
                }
                if record.install_state.is_active() {
                    warn!(
                        "{} is no longer owned but is {}, keeping it until the job ends",
                        record.id, record.install_state
                    );
                    continue;
                }
                diff.removed.push(record.id.clone());
            }
            for id in &diff.removed {
                records.remove(id);
            }
        }

        for id in diff
            .added
            .iter()
            .chain(diff.changed.iter())
            .map(|record| &record.id)
            .chain(diff.removed.iter())
        {
            self.persist(id);
        }

        diff.added.sort_by(by_name);
        diff.changed.sort_by(by_name);
        diff.removed.sort();

        info!(
            "Catalog synchronized: {} added, {} removed, {} changed",
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );
        Ok(diff)
    }

    /// Get a title record
    pub fn get(&self, title_id: &str) -> Option<TitleRecord> {
        self.read().get(title_id).cloned()
    }

    /// All title records ordered by name
    pub fn all(&self) -> Vec<TitleRecord> {
        let mut records: Vec<TitleRecord> = self.read().values().cloned().collect();
        records.sort_by(by_name);
        records
    }

    /// Case-insensitive substring search over title names
    pub fn search(&self, query: &str) -> SearchResults {
        SearchResults::new(self.all().into(), query)
    }

    /// Replace the launch options of a title
    pub fn set_launch_options(
        &self,
        title_id: &str,
        options: Vec<LaunchOption>,
    ) -> Option<TitleRecord> {
        let updated = {
            let mut records = self.write();
            let record = records.get_mut(title_id)?;
            record.launch_options = options;
            record.clone()
        };

        info!("Updated launch options of {}", title_id);
        self.persist(title_id);
        Some(updated)
    }

    /// Choose the runner of a title, or `None` to pick one per launch
    pub fn set_runner(&self, title_id: &str, runner: Option<Runner>) -> Option<TitleRecord> {
        let updated = {
            let mut records = self.write();
            let record = records.get_mut(title_id)?;
            record.runner = runner;
            record.clone()
        };

        match &updated.runner {
            Some(runner) => info!("{} now runs with {}", title_id, runner),
            None => info!("{} now picks its runner at launch", title_id),
        }
        self.persist(title_id);
        Some(updated)
    }

    /// Record the install state and path of a title
    ///
    /// Returns `None` when the title is not in the catalog.
    pub fn update_install(
        &self,
        title_id: &str,
        state: InstallState,
        install_path: Option<PathBuf>,
    ) -> Option<TitleRecord> {
        let updated = {
            let mut records = self.write();
            let record = records.get_mut(title_id)?;
            if record.install_state == state && record.install_path == install_path {
                return Some(record.clone());
            }
            record.install_state = state;
            record.install_path = install_path;
            record.clone()
        };

        debug!("{} is now {}", title_id, updated.install_state);
        self.persist(title_id);
        Some(updated)
    }

    /// Write the current record of a title to the cache, or drop it if gone
    fn persist(&self, title_id: &str) {
        let _guard = self.persist_lock.lock().unwrap_or_else(|p| p.into_inner());

        let result = match self.get(title_id) {
            Some(record) => self.cache.save(&record),
            None => self.cache.remove(title_id),
        };

        if let Err(e) = result {
            warn!("Failed to update catalog cache for {}: {:#}", title_id, e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TitleRecord>> {
        self.records.read().unwrap_or_else(|poisoned| {
            warn!("Catalog lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TitleRecord>> {
        self.records.write().unwrap_or_else(|poisoned| {
            warn!("Catalog lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn by_name(a: &TitleRecord, b: &TitleRecord) -> std::cmp::Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.id.cmp(&b.id))
}

/// Install directories found under the install roots, keyed by title id
fn scan_install_roots(roots: &[PathBuf]) -> HashMap<String, PathBuf> {
    let mut found = HashMap::new();

    for root in roots {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(manifest) = InstallManifest::read_lenient(&path) {
                found.entry(manifest.title_id).or_insert(path);
            }
        }
    }

    found
}

/// Whether `dir` holds an install manifest for `title_id`
fn has_manifest_for(dir: &Path, title_id: &str) -> bool {
    InstallManifest::read_lenient(dir).map_or(false, |manifest| manifest.title_id == title_id)
}

/// Recorded install paths of settled records
fn recorded_paths<'a>(records: impl Iterator<Item = &'a TitleRecord>) -> Vec<(String, PathBuf)> {
    records
        .filter(|record| !record.install_state.is_active())
        .filter_map(|record| Some((record.id.clone(), record.install_path.clone()?)))
        .collect()
}

/// Each recorded install path with whether its manifest is still in place
fn check_install_paths(recorded: Vec<(String, PathBuf)>) -> HashMap<String, (PathBuf, bool)> {
    recorded
        .into_iter()
        .map(|(id, path)| {
            let intact = has_manifest_for(&path, &id);
            (id, (path, intact))
        })
        .collect()
}

/// Re-derive the install state of a settled record from the filesystem checks
///
/// Records owned by a job, or whose path moved since `checked` was taken, are
/// left alone. Returns whether the record changed.
fn reconcile(
    record: &mut TitleRecord,
    checked: &HashMap<String, (PathBuf, bool)>,
    found: &HashMap<String, PathBuf>,
) -> bool {
    if !matches!(
        record.install_state,
        InstallState::Installed | InstallState::NotInstalled
    ) {
        return false;
    }

    let recorded = match (&record.install_path, checked.get(&record.id)) {
        (Some(path), Some((checked_path, intact))) if path == checked_path => {
            intact.then(|| path.clone())
        }
        (Some(_), _) => return false,
        (None, _) => None,
    };
    let install_path = recorded.or_else(|| found.get(&record.id).cloned());

    let state = if install_path.is_some() {
        InstallState::Installed
    } else {
        InstallState::NotInstalled
    };

    if record.install_state == state && record.install_path == install_path {
        return false;
    }

    info!(
        "Reconciled {}: {} -> {}",
        record.id, record.install_state, state
    );
    record.install_state = state;
    record.install_path = install_path;
    true
}
