use log::{error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::download::Downloader;
use super::install::{install_artifact, install_folder_name, uninstall_dir, InstallRequest};
use super::job::{JobHandle, JobReporter, ProgressEvent, ProgressSubscription};
use super::manifest::InstallManifest;
use super::state::InstallState;
use super::verify::verify_artifact;
use crate::catalog::Catalog;
use crate::config::{DownloadConfig, SettingsStore};
use crate::error::InstallError;
use crate::remote::ContentService;
use crate::session::SessionManager;

/// Buffered progress events per subscriber
const EVENT_CAPACITY: usize = 256;

/// Job waiting for a download slot
struct QueuedJob {
    cancel: CancellationToken,
    start: oneshot::Sender<OwnedSemaphorePermit>,
}

/// Drives install jobs through download, verification and extraction
///
/// Every job runs on its own task. Jobs are admitted in request order by a
/// dispatcher that hands out a bounded number of slots.
pub struct InstallPipeline {
    catalog: Arc<Catalog>,
    session: Arc<SessionManager>,
    content: Arc<dyn ContentService>,
    downloader: Downloader,
    queue: mpsc::UnboundedSender<QueuedJob>,
    /// Current job of each title, kept after cancel/failure until dismissed
    jobs: Mutex<HashMap<String, JobHandle>>,
    events: broadcast::Sender<ProgressEvent>,
    next_id: AtomicU64,
}

impl InstallPipeline {
    /// Create the pipeline and start its dispatcher
    ///
    /// The number of concurrent jobs is taken from `settings` once; the other
    /// download settings are read again for every job.
    pub fn new(
        catalog: Arc<Catalog>,
        session: Arc<SessionManager>,
        content: Arc<dyn ContentService>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        let max_concurrent = settings.get().downloads.max_concurrent;
        let slots = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let (queue, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(slots, queue_rx));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            downloader: Downloader::new(content.clone(), session.clone(), settings),
            catalog,
            session,
            content,
            queue,
            jobs: Mutex::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
        })
    }

    /// Queue the installation of a title into `target_dir`
    ///
    /// The title is installed into its own folder under `target_dir`. While a
    /// job for the title is active the existing handle is returned.
    pub fn request_install(
        self: &Arc<Self>,
        title_id: &str,
        target_dir: &Path,
    ) -> Result<JobHandle, InstallError> {
        let record = self
            .catalog
            .get(title_id)
            .ok_or_else(|| InstallError::UnknownTitle(title_id.to_string()))?;

        let mut jobs = self.lock_jobs();

        if let Some(existing) = jobs.get(title_id) {
            let snapshot = existing.snapshot();
            if snapshot.state.is_active() {
                info!("Install of {} already {}", title_id, snapshot.state);
                return Ok(existing.clone());
            }

            jobs.remove(title_id);
            if matches!(snapshot.state, InstallState::Cancelled | InstallState::Failed(_)) {
                info!("Dismissing previous {} install of {}", snapshot.state, title_id);
                self.record_state(title_id, InstallState::NotInstalled, None);
            }
        }

        if record.install_state == InstallState::Installed {
            return Err(InstallError::AlreadyInstalled);
        }

        let install_path = target_dir.join(install_folder_name(&record.name, &record.id));
        self.check_target(&jobs, title_id, &install_path)?;

        let (mut reporter, handle) = JobReporter::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            title_id,
            install_path.clone(),
            record.size_bytes,
            self.downloader.job_config().progress_step_percent,
            self.events.clone(),
        );

        let (start, start_rx) = oneshot::channel();
        if self
            .queue
            .send(QueuedJob {
                cancel: handle.cancel_token().clone(),
                start,
            })
            .is_err()
        {
            return Err(InstallError::ServiceError(
                "install dispatcher is not running".to_string(),
            ));
        }

        jobs.insert(title_id.to_string(), handle.clone());
        self.record_state(title_id, InstallState::Queued, None);
        reporter.announce();

        tokio::spawn(self.clone().run(reporter, handle.clone(), install_path, start_rx));

        Ok(handle)
    }

    /// Target directories of concurrent installs must be disjoint and new
    fn check_target(
        &self,
        jobs: &HashMap<String, JobHandle>,
        title_id: &str,
        install_path: &Path,
    ) -> Result<(), InstallError> {
        let active_paths = jobs
            .values()
            .map(|job| job.snapshot())
            .filter(|snapshot| snapshot.state.is_active())
            .map(|snapshot| snapshot.install_path);

        let installed_paths = self
            .catalog
            .all()
            .into_iter()
            .filter(|record| record.id != title_id)
            .filter_map(|record| record.install_path);

        for path in active_paths.chain(installed_paths) {
            if overlaps(&path, install_path) {
                warn!(
                    "Install of {} into {} conflicts with {}",
                    title_id,
                    install_path.display(),
                    path.display()
                );
                return Err(InstallError::TargetInUse(install_path.to_path_buf()));
            }
        }

        let occupied = std::fs::read_dir(install_path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if occupied {
            return Err(InstallError::TargetNotEmpty(install_path.to_path_buf()));
        }

        Ok(())
    }

    /// Request cancellation of a title's active job
    ///
    /// Returns whether there was an active job to cancel.
    pub fn cancel(&self, title_id: &str) -> bool {
        match self.lock_jobs().get(title_id) {
            Some(job) if job.snapshot().state.is_active() => {
                info!("Cancellation requested for {}", title_id);
                job.cancel();
                true
            }
            _ => false,
        }
    }

    /// Return a cancelled or failed title to not installed
    pub fn dismiss(&self, title_id: &str) -> Result<(), InstallError> {
        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.get(title_id) {
                if job.snapshot().state.is_active() {
                    return Err(InstallError::Busy);
                }
                jobs.remove(title_id);
            }
        }

        let record = self
            .catalog
            .get(title_id)
            .ok_or_else(|| InstallError::UnknownTitle(title_id.to_string()))?;

        if matches!(
            record.install_state,
            InstallState::Cancelled | InstallState::Failed(_)
        ) {
            info!("Dismissed {} install of {}", record.install_state, title_id);
            self.record_state(title_id, InstallState::NotInstalled, None);
        }

        Ok(())
    }

    /// Remove an installed title
    pub async fn uninstall(&self, title_id: &str) -> Result<(), InstallError> {
        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.get(title_id) {
                if job.snapshot().state.is_active() {
                    return Err(InstallError::Busy);
                }
                jobs.remove(title_id);
            }
        }

        let record = self
            .catalog
            .get(title_id)
            .ok_or_else(|| InstallError::UnknownTitle(title_id.to_string()))?;

        let install_path = match (&record.install_state, record.install_path) {
            (InstallState::Installed, Some(path)) => path,
            _ => return Err(InstallError::NotInstalled),
        };

        let result = tokio::task::spawn_blocking(move || uninstall_dir(&install_path))
            .await
            .map_err(|e| InstallError::Filesystem(format!("uninstall task failed: {}", e)))?;

        match result {
            Ok(_) => {
                self.record_state(title_id, InstallState::NotInstalled, None);
                info!("Uninstalled {}", title_id);
                Ok(())
            }
            Err(InstallError::NotInstalled) => {
                warn!("Install manifest of {} is gone, marking it not installed", title_id);
                self.record_state(title_id, InstallState::NotInstalled, None);
                Err(InstallError::NotInstalled)
            }
            Err(e) => {
                error!("Uninstall of {} failed: {}", title_id, e);
                Err(e)
            }
        }
    }

    /// Files listed in a title's install manifest that are missing on disk
    pub fn check_installation(&self, title_id: &str) -> Result<Vec<PathBuf>, InstallError> {
        let record = self
            .catalog
            .get(title_id)
            .ok_or_else(|| InstallError::UnknownTitle(title_id.to_string()))?;
        let install_path = record.install_path.ok_or(InstallError::NotInstalled)?;

        let manifest = InstallManifest::read(&install_path)?.ok_or(InstallError::NotInstalled)?;
        let missing = manifest.missing_files(&install_path);
        if !missing.is_empty() {
            warn!("{} is missing {} installed files", title_id, missing.len());
        }

        Ok(missing)
    }

    /// Handle of a title's current job
    pub fn job(&self, title_id: &str) -> Option<JobHandle> {
        self.lock_jobs().get(title_id).cloned()
    }

    /// Progress events of one title
    pub fn subscribe(&self, title_id: &str) -> ProgressSubscription {
        ProgressSubscription::new(title_id, self.events.subscribe())
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            warn!("Job table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Job task: wait for a slot, run the job, publish its outcome
    async fn run(
        self: Arc<Self>,
        mut reporter: JobReporter,
        handle: JobHandle,
        install_path: PathBuf,
        start: oneshot::Receiver<OwnedSemaphorePermit>,
    ) {
        let cancel = handle.cancel_token().clone();
        let title_id = reporter.snapshot().title_id;
        let downloads = self.downloader.job_config();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = start => permit.ok(),
        };

        let result = match permit {
            Some(_permit) => {
                self.execute(&mut reporter, &title_id, &install_path, &downloads, &cancel)
                    .await
            }
            None => Err(InstallError::Cancelled),
        };

        match result {
            Ok(()) => {
                let mut jobs = self.lock_jobs();
                if jobs.get(&title_id).map_or(false, |job| job.id() == handle.id()) {
                    jobs.remove(&title_id);
                }
            }
            Err(InstallError::Cancelled) => {
                if !downloads.resume_partial {
                    self.discard_partial(&title_id).await;
                }
                self.record_state(&title_id, InstallState::Cancelled, None);
                reporter.transition(InstallState::Cancelled);
            }
            Err(e) => {
                error!("Install of {} failed: {}", title_id, e);
                let resumable =
                    e == InstallError::NetworkUnavailable && downloads.resume_partial;
                if !resumable {
                    self.discard_partial(&title_id).await;
                }
                self.record_state(&title_id, InstallState::Failed(e.clone()), None);
                reporter.transition(InstallState::Failed(e));
            }
        }
    }

    /// Download, verify, then install
    async fn execute(
        &self,
        reporter: &mut JobReporter,
        title_id: &str,
        install_path: &Path,
        downloads: &DownloadConfig,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        self.advance(reporter, title_id, InstallState::Downloading);

        let content = &self.content;
        let manifest = tokio::select! {
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            manifest = self.session.authorized(|token| async move {
                content.fetch_manifest(&token, title_id).await
            }) => manifest?,
        };
        if manifest.size_bytes > 0 {
            reporter.set_total(manifest.size_bytes);
        }

        let artifact = self
            .downloader
            .download(title_id, &manifest, downloads, cancel, |bytes| {
                reporter.progress(bytes)
            })
            .await?;

        // checkpoint: before verification
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        self.advance(reporter, title_id, InstallState::Verifying);

        let expected = manifest.checksum.clone();
        let verified = artifact.clone();
        tokio::task::spawn_blocking(move || verify_artifact(&verified, &expected))
            .await
            .map_err(|e| InstallError::Filesystem(format!("verification task failed: {}", e)))??;

        // checkpoint: before extraction
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        self.advance(reporter, title_id, InstallState::Installing);

        let request = InstallRequest {
            title_id: title_id.to_string(),
            version: manifest
                .version
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            size_bytes: manifest.size_bytes,
            file_name: manifest
                .file_name
                .clone()
                .unwrap_or_else(|| format!("{}.bin", install_folder_name(title_id, title_id))),
            executable: manifest.executable.clone(),
        };
        let source = artifact.clone();
        let target = install_path.to_path_buf();
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || install_artifact(&source, &target, &request, &token))
            .await
            .map_err(|e| InstallError::Filesystem(format!("install task failed: {}", e)))??;

        if let Err(e) = tokio::fs::remove_file(&artifact).await {
            warn!("Failed to remove {}: {}", artifact.display(), e);
        }

        let downloaded = reporter.snapshot().bytes_downloaded;
        if reporter.snapshot().bytes_total == 0 {
            reporter.set_total(downloaded);
        }

        self.record_state(
            title_id,
            InstallState::Installed,
            Some(install_path.to_path_buf()),
        );
        reporter.transition(InstallState::Installed);
        Ok(())
    }

    /// Mirror a job state on the catalog record, then publish it
    fn advance(&self, reporter: &mut JobReporter, title_id: &str, state: InstallState) {
        self.record_state(title_id, state.clone(), None);
        reporter.transition(state);
    }

    fn record_state(&self, title_id: &str, state: InstallState, install_path: Option<PathBuf>) {
        if self
            .catalog
            .update_install(title_id, state.clone(), install_path)
            .is_none()
        {
            warn!("{} is not in the catalog, {} not recorded", title_id, state);
        }
    }

    async fn discard_partial(&self, title_id: &str) {
        let path = self.downloader.partial_path(title_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed partial download {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

/// Hand out slots to queued jobs in request order
async fn dispatch(slots: Arc<Semaphore>, mut queue: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(job) = queue.recv().await {
        if job.cancel.is_cancelled() {
            continue;
        }

        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        // A job cancelled meanwhile has dropped its receiver; the permit comes back
        let _ = job.start.send(permit);
    }
}

/// Whether one directory contains the other
fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
