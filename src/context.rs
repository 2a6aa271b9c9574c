use anyhow::{Context, Result};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::catalog::{Catalog, CatalogCache, CatalogDiff, SearchResults, TitleRecord};
use crate::config::{Settings, SettingsStore, SettingsUpdate};
use crate::error::{AuthError, InstallError, LaunchError, SyncError};
use crate::installer::{InstallPipeline, JobHandle, ProgressSubscription};
use crate::launcher::{LaunchManager, LaunchOption, ProcessHandle, Runner};
use crate::remote::{CatalogService, ContentService, HttpRemote, IdentityService};
use crate::session::{CredentialStore, FileCredentialStore, Session, SessionManager};

/// File name of the persisted session inside the data directory
const SESSION_FILE_NAME: &str = "session.json";

/// Remote collaborators and the credential store the client runs against
pub struct Services {
    pub identity: Arc<dyn IdentityService>,
    pub catalog: Arc<dyn CatalogService>,
    pub content: Arc<dyn ContentService>,
    pub credentials: Arc<dyn CredentialStore>,
}

/// Wires the components together and exposes the commands of the view layer
pub struct ClientContext {
    settings: Arc<SettingsStore>,
    session: Arc<SessionManager>,
    catalog: Arc<Catalog>,
    pipeline: Arc<InstallPipeline>,
    launcher: LaunchManager,
}

impl ClientContext {
    /// Context talking to the real service over HTTP
    pub fn open(settings: Arc<SettingsStore>) -> Result<Self> {
        let current = settings.get();

        let remote = Arc::new(
            HttpRemote::new(
                current.service.clone(),
                Duration::from_secs(current.downloads.request_timeout_secs),
            )
            .context("Failed to create HTTP client")?,
        );
        let credentials = Arc::new(FileCredentialStore::new(
            current.paths.data_dir.join(SESSION_FILE_NAME),
        ));

        Self::with_services(
            settings,
            Services {
                identity: remote.clone(),
                catalog: remote.clone(),
                content: remote,
                credentials,
            },
        )
    }

    /// Context over arbitrary collaborators
    ///
    /// Restores the persisted session and loads the cached catalog.
    pub fn with_services(settings: Arc<SettingsStore>, services: Services) -> Result<Self> {
        let current = settings.get();
        current
            .ensure_directories()
            .context("Failed to create client directories")?;

        let session = Arc::new(SessionManager::new(services.identity, services.credentials));
        session.restore();

        let cache = CatalogCache::new(&current.paths.cache_dir)?;
        let catalog = Arc::new(Catalog::open(
            cache,
            session.clone(),
            services.catalog,
            settings.clone(),
        )?);

        let pipeline = InstallPipeline::new(
            catalog.clone(),
            session.clone(),
            services.content,
            settings.clone(),
        );
        let launcher = LaunchManager::new(catalog.clone(), settings.clone());

        info!("Client ready with {} cached titles", catalog.all().len());

        Ok(Self {
            settings,
            session,
            catalog,
            pipeline,
            launcher,
        })
    }

    // session

    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, AuthError> {
        self.session.login(identifier, secret).await
    }

    pub async fn login_with_oauth(&self, auth_code: &str) -> Result<Session, AuthError> {
        self.session.login_with_oauth(auth_code).await
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    pub fn get_session(&self) -> Session {
        self.session.current_session()
    }

    /// Session state changes
    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    // library

    pub async fn sync_library(&self) -> Result<CatalogDiff, SyncError> {
        self.catalog.sync().await
    }

    /// All titles ordered by name
    pub fn get_catalog(&self) -> Vec<TitleRecord> {
        self.catalog.all()
    }

    pub fn get_title(&self, title_id: &str) -> Option<TitleRecord> {
        self.catalog.get(title_id)
    }

    pub fn search_local(&self, query: &str) -> SearchResults {
        self.catalog.search(query)
    }

    pub fn set_launch_options(
        &self,
        title_id: &str,
        options: Vec<LaunchOption>,
    ) -> Option<TitleRecord> {
        self.catalog.set_launch_options(title_id, options)
    }

    /// Choose the runner of a title; `None` picks one at every launch
    pub fn set_runner(&self, title_id: &str, runner: Option<Runner>) -> Option<TitleRecord> {
        self.catalog.set_runner(title_id, runner)
    }

    // installation

    pub fn request_install(
        &self,
        title_id: &str,
        target_dir: &Path,
    ) -> Result<JobHandle, InstallError> {
        self.pipeline.request_install(title_id, target_dir)
    }

    /// First configured install root
    pub fn default_install_root(&self) -> Option<PathBuf> {
        self.settings.get().install_root_directories.into_iter().next()
    }

    pub fn cancel_install(&self, title_id: &str) -> bool {
        self.pipeline.cancel(title_id)
    }

    pub fn dismiss(&self, title_id: &str) -> Result<(), InstallError> {
        self.pipeline.dismiss(title_id)
    }

    pub async fn uninstall(&self, title_id: &str) -> Result<(), InstallError> {
        self.pipeline.uninstall(title_id).await
    }

    /// Installed files that are missing on disk
    pub fn check_installation(&self, title_id: &str) -> Result<Vec<PathBuf>, InstallError> {
        self.pipeline.check_installation(title_id)
    }

    pub fn subscribe_progress(&self, title_id: &str) -> ProgressSubscription {
        self.pipeline.subscribe(title_id)
    }

    pub fn job(&self, title_id: &str) -> Option<JobHandle> {
        self.pipeline.job(title_id)
    }

    // launching

    pub fn launch(&self, title_id: &str) -> Result<ProcessHandle, LaunchError> {
        self.launcher.launch(title_id)
    }

    pub fn stop(&self, title_id: &str) -> bool {
        self.launcher.stop(title_id)
    }

    pub fn is_running(&self, title_id: &str) -> bool {
        self.launcher.is_running(title_id)
    }

    /// Wine, Proton and wrapper installations found on this machine
    pub fn available_runners(&self) -> Vec<Runner> {
        self.launcher.available_runners()
    }

    // settings

    pub fn get_settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn update_settings(&self, update: SettingsUpdate) -> Result<Settings> {
        self.settings.update(update)
    }
}
