use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::launcher::LaunchOption;

/// Application name used for config/data/cache directories
const APP_DIR: &str = "galaxy-client";

/// Prefix of environment variables overriding settings (e.g. `GALAXY__DOWNLOADS__MAX_CONCURRENT`)
const ENV_PREFIX: &str = "GALAXY";

/// Application settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directories offered as installation targets, in preference order
    pub install_root_directories: Vec<PathBuf>,

    /// Launch options applied to every title unless overridden per title
    pub default_launch_options: Vec<LaunchOption>,

    /// Local paths configuration
    pub paths: PathsConfig,

    /// Download behavior
    pub downloads: DownloadConfig,

    /// Remote service configuration
    pub service: ServiceConfig,
}

/// Local paths configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for the persisted session
    pub data_dir: PathBuf,

    /// Directory for the catalog cache
    pub cache_dir: PathBuf,

    /// Directory for partial downloads
    pub temp_dir: PathBuf,
}

/// Download configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of installs admitted at the same time
    pub max_concurrent: usize,

    /// Automatic retries after a transient network failure
    pub max_retries: u32,

    /// Delay before the first retry, doubled on every further attempt
    pub retry_base_delay_ms: u64,

    /// Per-request timeout, also applied to every read of a download stream
    pub request_timeout_secs: u64,

    /// Keep partial downloads on cancel and resume them on the next request
    pub resume_partial: bool,

    /// Minimum progress (in percent of the artifact) between two progress events
    pub progress_step_percent: u8,
}

/// Remote service configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// OAuth token endpoint
    pub auth_url: String,

    /// Base URL of the catalog and content delivery API
    pub api_url: String,

    /// OAuth client ID
    pub client_id: String,

    /// OAuth client secret
    pub client_secret: String,

    /// Redirect URI registered for the authorization-code login page
    pub redirect_uri: String,
}

impl Default for Settings {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            install_root_directories: vec![home_dir.join("Games")],
            default_launch_options: Vec::new(),
            paths: PathsConfig::default(),
            downloads: DownloadConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| home_dir.join(".local").join("share"))
                .join(APP_DIR),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| home_dir.join(".cache"))
                .join(APP_DIR),
            temp_dir: std::env::temp_dir().join(APP_DIR),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 30,
            resume_partial: true,
            progress_step_percent: 1,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://auth.gog.com/token".to_string(),
            api_url: "https://embed.gog.com".to_string(),
            client_id: "".to_string(),
            client_secret: "".to_string(),
            redirect_uri: "https://embed.gog.com/on_login_success?origin=client".to_string(),
        }
    }
}

impl Settings {
    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("settings.toml")
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load settings from a file, layered under environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Settings file not found at {}, using defaults", path.display());
        }

        let layered = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        let settings: Settings = layered
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save settings to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let settings_str = toml::to_string(self).context("Failed to serialize settings")?;
        fs::write(path, settings_str)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;

        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Check values that would make the client unusable
    pub fn validate(&self) -> Result<()> {
        if self.downloads.max_concurrent == 0 {
            anyhow::bail!("downloads.max_concurrent must be at least 1");
        }
        if self.install_root_directories.is_empty() {
            anyhow::bail!("at least one install root directory is required");
        }
        if self.downloads.progress_step_percent > 100 {
            anyhow::bail!("downloads.progress_step_percent must be between 0 and 100");
        }
        Ok(())
    }

    /// Ensure all configured directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.paths.data_dir,
            &self.paths.cache_dir,
            &self.paths.temp_dir,
        ] {
            if !dir.exists() {
                info!("Creating directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }

        Ok(())
    }

    /// Settings rooted in a single directory, used for portable setups and tests
    pub fn portable(root: &Path) -> Self {
        Self {
            install_root_directories: vec![root.join("games")],
            paths: PathsConfig {
                data_dir: root.join("data"),
                cache_dir: root.join("cache"),
                temp_dir: root.join("tmp"),
            },
            ..Self::default()
        }
    }
}

/// Partial settings update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SettingsUpdate {
    pub install_root_directories: Option<Vec<PathBuf>>,
    pub default_launch_options: Option<Vec<LaunchOption>>,
    pub max_concurrent_downloads: Option<usize>,
    pub max_retries: Option<u32>,
    pub resume_partial: Option<bool>,
}

impl SettingsUpdate {
    fn apply(self, settings: &mut Settings) {
        if let Some(roots) = self.install_root_directories {
            settings.install_root_directories = roots;
        }
        if let Some(options) = self.default_launch_options {
            settings.default_launch_options = options;
        }
        if let Some(max) = self.max_concurrent_downloads {
            settings.downloads.max_concurrent = max;
        }
        if let Some(retries) = self.max_retries {
            settings.downloads.max_retries = retries;
        }
        if let Some(resume) = self.resume_partial {
            settings.downloads.resume_partial = resume;
        }
    }
}

/// Live settings shared by all components
///
/// Updates are serialized by `update_lock` and take the write lock only for
/// the in-memory swap; readers get a cloned snapshot and never wait on disk I/O.
pub struct SettingsStore {
    settings: RwLock<Settings>,
    path: Option<PathBuf>,
    update_lock: Mutex<()>,
}

impl SettingsStore {
    /// Create a store persisting to `path`
    pub fn new(settings: Settings, path: PathBuf) -> Self {
        Self {
            settings: RwLock::new(settings),
            path: Some(path),
            update_lock: Mutex::new(()),
        }
    }

    /// Create a store that never touches the disk
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            path: None,
            update_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> Settings {
        self.read().clone()
    }

    /// Apply a partial update, validate, persist and return the new settings
    pub fn update(&self, update: SettingsUpdate) -> Result<Settings> {
        // held from read to swap so concurrent updates both land
        let _guard = self.update_lock.lock().unwrap_or_else(|poisoned| {
            warn!("Settings update lock poisoned, recovering");
            poisoned.into_inner()
        });

        let mut next = self.get();
        update.apply(&mut next);
        next.validate()?;

        if let Some(path) = &self.path {
            next.save_to(path)?;
        }

        *self.write() = next.clone();
        Ok(next)
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(|poisoned| {
            warn!("Settings lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(|poisoned| {
            warn!("Settings lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
