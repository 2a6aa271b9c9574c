pub mod download;
pub mod install;
pub mod job;
pub mod manifest;
pub mod pipeline;
pub mod state;
pub mod verify;

pub use download::Downloader;
pub use job::{JobHandle, JobSnapshot, ProgressEvent, ProgressSubscription};
pub use manifest::InstallManifest;
pub use pipeline::InstallPipeline;
pub use state::{IllegalTransition, InstallState};
