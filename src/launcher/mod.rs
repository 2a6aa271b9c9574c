pub mod launch;
pub mod options;
pub mod runner;

pub use launch::{LaunchManager, ProcessHandle};
pub use options::{merge_options, LaunchCommand, LaunchOption};
pub use runner::{detect_platform, select_runner, Platform, Runner, RunnerDiscovery};
