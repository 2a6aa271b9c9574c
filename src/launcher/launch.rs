use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Child;

use super::options::{merge_options, LaunchCommand};
use super::runner::{detect_platform, select_runner, Runner, RunnerDiscovery};
use crate::catalog::Catalog;
use crate::config::SettingsStore;
use crate::error::LaunchError;
use crate::installer::{InstallManifest, InstallState};

/// Running game process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub title_id: String,
    /// OS process id; `None` once the process has been reaped
    pub pid: Option<u32>,
}

/// Starts and stops installed titles
pub struct LaunchManager {
    catalog: Arc<Catalog>,
    settings: Arc<SettingsStore>,
    discovery: RunnerDiscovery,
    /// Processes started by this manager, by title
    children: Mutex<HashMap<String, Child>>,
}

impl LaunchManager {
    pub fn new(catalog: Arc<Catalog>, settings: Arc<SettingsStore>) -> Self {
        Self::with_discovery(catalog, settings, RunnerDiscovery::from_env())
    }

    /// Launcher looking for runners with `discovery`
    pub fn with_discovery(
        catalog: Arc<Catalog>,
        settings: Arc<SettingsStore>,
        discovery: RunnerDiscovery,
    ) -> Self {
        Self {
            catalog,
            settings,
            discovery,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Runners found on this machine
    pub fn available_runners(&self) -> Vec<Runner> {
        self.discovery.discover()
    }

    /// Runner of a title: its own choice, or the first that fits the executable
    fn runner_for(
        &self,
        configured: Option<Runner>,
        executable: &Path,
    ) -> Result<Runner, LaunchError> {
        if let Some(runner) = configured {
            if !runner.is_available() {
                warn!("Configured runner {} is not installed", runner);
                return Err(LaunchError::RunnerUnavailable(runner.to_string()));
            }
            return Ok(runner);
        }

        let platform = detect_platform(executable);
        select_runner(&self.discovery.discover(), platform).ok_or_else(|| {
            warn!("No runner found for {} executable {}", platform, executable.display());
            LaunchError::RunnerUnavailable(format!("nothing runs {} executables", platform))
        })
    }

    /// Start an installed title
    ///
    /// A title whose install directory lost its manifest or executable is
    /// demoted to not installed.
    pub fn launch(&self, title_id: &str) -> Result<ProcessHandle, LaunchError> {
        let record = self
            .catalog
            .get(title_id)
            .ok_or_else(|| LaunchError::UnknownTitle(title_id.to_string()))?;

        if record.install_state != InstallState::Installed {
            return Err(LaunchError::NotInstalled);
        }
        let install_path = match record.install_path {
            Some(path) => path,
            None => {
                self.demote(title_id, "no install directory recorded");
                return Err(LaunchError::NotInstalled);
            }
        };

        let manifest = match InstallManifest::read_lenient(&install_path) {
            Some(manifest) => manifest,
            None => {
                self.demote(title_id, "install manifest is missing");
                return Err(LaunchError::NotInstalled);
            }
        };

        let executable = match manifest.executable_path(&install_path) {
            Some(executable) if executable.is_file() => executable,
            Some(executable) => {
                self.demote(title_id, "executable is missing");
                return Err(LaunchError::ExecutableMissing(executable));
            }
            None => {
                self.demote(title_id, "no executable recorded");
                return Err(LaunchError::ExecutableMissing(install_path));
            }
        };

        let mut children = self.lock_children();

        if let Some(child) = children.get_mut(title_id) {
            match child.try_wait() {
                Ok(None) => {
                    info!("{} is already running", title_id);
                    return Ok(ProcessHandle {
                        title_id: title_id.to_string(),
                        pid: child.id(),
                    });
                }
                _ => {
                    children.remove(title_id);
                }
            }
        }

        let runner = self.runner_for(record.runner.clone(), &executable)?;

        let options = merge_options(
            &self.settings.get().default_launch_options,
            &record.launch_options,
        );
        let command = LaunchCommand::from_options(&options);

        let working_dir = executable
            .parent()
            .map(|dir| dir.to_path_buf())
            .unwrap_or_else(|| install_path.clone());

        info!(
            "Launching {} ({}) via {} with {} arguments",
            title_id,
            executable.display(),
            runner,
            command.args.len()
        );

        let child = runner
            .command(&executable, &working_dir, &command)
            .spawn()
            .map_err(|e| {
                warn!("Failed to launch {}: {}", title_id, e);
                LaunchError::LaunchFailed(e.to_string())
            })?;

        let handle = ProcessHandle {
            title_id: title_id.to_string(),
            pid: child.id(),
        };
        children.insert(title_id.to_string(), child);

        Ok(handle)
    }

    /// Ask a running title to terminate
    ///
    /// Returns whether a signal was sent; stopping a title that is not
    /// running does nothing.
    pub fn stop(&self, title_id: &str) -> bool {
        let mut child = match self.lock_children().remove(title_id) {
            Some(child) => child,
            None => return false,
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                info!("{} already exited with {}", title_id, status);
                false
            }
            _ => match child.start_kill() {
                Ok(()) => {
                    info!("Stopping {}", title_id);
                    true
                }
                Err(e) => {
                    warn!("Failed to stop {}: {}", title_id, e);
                    false
                }
            },
        }
    }

    /// Whether a title started by this manager is still running
    pub fn is_running(&self, title_id: &str) -> bool {
        let mut children = self.lock_children();
        match children.get_mut(title_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn demote(&self, title_id: &str, reason: &str) {
        warn!("{} is no longer installed: {}", title_id, reason);
        self.catalog
            .update_install(title_id, InstallState::NotInstalled, None);
    }

    fn lock_children(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(|poisoned| {
            warn!("Process table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
