use log::debug;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::options::LaunchCommand;

/// Compatibility prefix used by Proton when the launch options name none
const PROTON_PREFIX_DIR: &str = ".galaxy-proton-prefix";

const PROTON_PREFIX_VAR: &str = "STEAM_COMPAT_DATA_PATH";

/// Folders holding custom compatibility tools such as GE-Proton, relative to
/// the home directory
const COMPAT_TOOL_DIRS: &[&str] = &[
    ".steam/root/compatibilitytools.d",
    ".steam/steam/compatibilitytools.d",
    ".local/share/Steam/compatibilitytools.d",
    ".var/app/com.valvesoftware.Steam/data/Steam/compatibilitytools.d",
];

/// Steam library folders holding Valve's Proton builds
const STEAM_COMMON_DIRS: &[&str] = &[
    ".steam/steam/steamapps/common",
    ".local/share/Steam/steamapps/common",
];

const WINE_NAMES: &[&str] = &["wine", "wine64"];

/// Translation layers for x86 binaries on other architectures
const WRAPPER_NAMES: &[&str] = &["box64", "FEXInterpreter", "qemu-x86_64"];

/// Binary format of a game executable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Runs on this operating system as is
    Native,
    /// PE executable
    Windows,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Native => write!(f, "native"),
            Platform::Windows => write!(f, "Windows"),
        }
    }
}

/// Guess the platform of an executable from its header
///
/// Unreadable files fall back to the extension.
pub fn detect_platform(executable: &Path) -> Platform {
    let mut magic = [0u8; 2];
    let read = File::open(executable).and_then(|mut file| file.read_exact(&mut magic));

    let is_pe = match read {
        Ok(()) => &magic == b"MZ",
        Err(_) => executable
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("exe")),
    };

    if is_pe {
        Platform::Windows
    } else {
        Platform::Native
    }
}

/// How an executable is started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Runner {
    /// Start the executable directly
    Native,
    /// `wine <game> <args>`
    Wine { path: PathBuf },
    /// `proton run <game> <args>` inside a compatibility prefix
    Proton { path: PathBuf },
    /// `<wrapper> <game> <args>`, e.g. box64 or FEX
    Wrapper { path: PathBuf },
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runner::Native => write!(f, "native"),
            Runner::Wine { path } => write!(f, "wine ({})", path.display()),
            Runner::Proton { path } => write!(f, "proton ({})", path.display()),
            Runner::Wrapper { path } => write!(f, "wrapper ({})", path.display()),
        }
    }
}

impl Runner {
    /// Program the runner puts in front of the game, if any
    pub fn program(&self) -> Option<&Path> {
        match self {
            Runner::Native => None,
            Runner::Wine { path } | Runner::Proton { path } | Runner::Wrapper { path } => {
                Some(path)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.program().map_or(true, Path::is_file)
    }

    /// Whether executables of `platform` can be started
    pub fn can_run(&self, platform: Platform) -> bool {
        match self {
            Runner::Native => platform == Platform::Native || cfg!(windows),
            Runner::Wine { .. } | Runner::Proton { .. } => platform == Platform::Windows,
            Runner::Wrapper { .. } => platform == Platform::Native,
        }
    }

    /// Command starting `executable` from `working_dir` with `launch` applied
    pub fn command(&self, executable: &Path, working_dir: &Path, launch: &LaunchCommand) -> Command {
        let mut command = match self {
            Runner::Native => Command::new(executable),
            Runner::Wine { path } | Runner::Wrapper { path } => {
                let mut command = Command::new(path);
                command.arg(executable);
                command
            }
            Runner::Proton { path } => {
                let mut command = Command::new(path);
                command.arg("run").arg(executable);
                if !launch.env.iter().any(|(key, _)| key == PROTON_PREFIX_VAR) {
                    command.env(PROTON_PREFIX_VAR, working_dir.join(PROTON_PREFIX_DIR));
                }
                command
            }
        };

        command
            .args(&launch.args)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(working_dir);
        command
    }
}

/// First available runner able to start `platform` executables
pub fn select_runner(runners: &[Runner], platform: Platform) -> Option<Runner> {
    runners
        .iter()
        .find(|runner| runner.can_run(platform) && runner.is_available())
        .cloned()
}

/// Finds runners installed on this machine
#[derive(Debug, Clone, Default)]
pub struct RunnerDiscovery {
    /// `PATH`-style list of directories searched for wine and wrappers
    search_path: Option<OsString>,
    home: Option<PathBuf>,
}

impl RunnerDiscovery {
    pub fn new(search_path: Option<OsString>, home: Option<PathBuf>) -> Self {
        Self { search_path, home }
    }

    /// Search the process `PATH` and the user's Steam folders
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("PATH"), dirs::home_dir())
    }

    /// Native first, then wine, Proton builds newest first, then wrappers
    pub fn discover(&self) -> Vec<Runner> {
        let mut runners = vec![Runner::Native];

        let wine = WINE_NAMES
            .iter()
            .filter_map(|name| self.find_on_path(name))
            .map(|path| Runner::Wine { path });
        let proton = self
            .proton_installs()
            .into_iter()
            .map(|path| Runner::Proton { path });
        let wrappers = WRAPPER_NAMES
            .iter()
            .filter_map(|name| self.find_on_path(name))
            .map(|path| Runner::Wrapper { path });

        for runner in wine.chain(proton).chain(wrappers) {
            if !runners.contains(&runner) {
                debug!("Found runner {}", runner);
                runners.push(runner);
            }
        }

        runners
    }

    fn find_on_path(&self, name: &str) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// `proton` scripts of the Proton builds under the Steam folders
    fn proton_installs(&self) -> Vec<PathBuf> {
        let home = match &self.home {
            Some(home) => home,
            None => return Vec::new(),
        };

        let mut installs = Vec::new();
        for dir in COMPAT_TOOL_DIRS.iter().chain(STEAM_COMMON_DIRS) {
            let entries = match fs::read_dir(home.join(dir)) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            let mut found: Vec<(String, PathBuf)> = entries
                .flatten()
                .filter_map(|entry| {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let script = entry.path().join("proton");
                    let is_proton = name.starts_with("Proton") || name.starts_with("GE-Proton");
                    (is_proton && script.is_file()).then(|| (name, script))
                })
                .collect();
            found.sort();

            for (_, script) in found.into_iter().rev() {
                if !installs.contains(&script) {
                    installs.push(script);
                }
            }
        }

        installs
    }
}
