use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the remote collaborators (identity, catalog, content delivery)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection could not be established or was dropped
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its time budget
    #[error("request timed out")]
    Timeout,

    /// Token was rejected
    #[error("unauthorized")]
    Unauthorized,

    /// Login or password are wrong
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Requested byte range cannot be served
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,

    /// The service answered with an error
    #[error("service error: {0}")]
    Service(String),
}

impl RemoteError {
    /// Whether the failure is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }
}

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("service error: {0}")]
    ServiceError(String),

    #[error("session expired")]
    Expired,

    #[error("not authenticated")]
    NotAuthenticated,
}

impl From<RemoteError> for AuthError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Network(_) | RemoteError::Timeout => AuthError::NetworkUnavailable,
            RemoteError::InvalidCredentials => AuthError::InvalidCredentials,
            RemoteError::Unauthorized => AuthError::Expired,
            RemoteError::RangeNotSatisfiable => {
                AuthError::ServiceError("requested range not satisfiable".to_string())
            }
            RemoteError::Service(msg) => AuthError::ServiceError(msg),
        }
    }
}

/// Failure of a call made on behalf of the active session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizedError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Catalog synchronization errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("service error: {0}")]
    ServiceError(String),

    #[error("authentication required")]
    AuthRequired,
}

impl From<AuthorizedError> for SyncError {
    fn from(e: AuthorizedError) -> Self {
        match e {
            AuthorizedError::Auth(AuthError::NetworkUnavailable) => SyncError::NetworkUnavailable,
            AuthorizedError::Auth(AuthError::ServiceError(msg)) => SyncError::ServiceError(msg),
            AuthorizedError::Auth(_) => SyncError::AuthRequired,
            AuthorizedError::Remote(RemoteError::Network(_) | RemoteError::Timeout) => {
                SyncError::NetworkUnavailable
            }
            AuthorizedError::Remote(RemoteError::Unauthorized | RemoteError::InvalidCredentials) => {
                SyncError::AuthRequired
            }
            AuthorizedError::Remote(other) => SyncError::ServiceError(other.to_string()),
        }
    }
}

/// ENOSPC
#[cfg(unix)]
const DISK_FULL_CODES: &[i32] = &[28];

/// ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
#[cfg(windows)]
const DISK_FULL_CODES: &[i32] = &[39, 112];

#[cfg(not(any(unix, windows)))]
const DISK_FULL_CODES: &[i32] = &[];

/// Installation errors
///
/// The first five variants are the failure taxonomy of a running job; the rest
/// are rejected requests or wrapped collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum InstallError {
    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("not enough disk space")]
    DiskFull,

    #[error("downloaded artifact is corrupt")]
    CorruptArtifact,

    #[error("permission denied")]
    PermissionDenied,

    #[error("cancelled")]
    Cancelled,

    #[error("authentication required")]
    AuthRequired,

    #[error("service error: {0}")]
    ServiceError(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("unknown title: {0}")]
    UnknownTitle(String),

    #[error("title is already installed")]
    AlreadyInstalled,

    #[error("title is not installed")]
    NotInstalled,

    #[error("target directory is used by another installation: {0}")]
    TargetInUse(PathBuf),

    #[error("target directory is not empty: {0}")]
    TargetNotEmpty(PathBuf),

    #[error("an installation is in progress for this title")]
    Busy,
}

impl From<io::Error> for InstallError {
    fn from(e: io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            if DISK_FULL_CODES.contains(&code) {
                return InstallError::DiskFull;
            }
        }
        match e.kind() {
            io::ErrorKind::PermissionDenied => InstallError::PermissionDenied,
            _ => InstallError::Filesystem(e.to_string()),
        }
    }
}

impl From<AuthorizedError> for InstallError {
    fn from(e: AuthorizedError) -> Self {
        match e {
            AuthorizedError::Auth(AuthError::NetworkUnavailable) => InstallError::NetworkUnavailable,
            AuthorizedError::Auth(_) => InstallError::AuthRequired,
            AuthorizedError::Remote(e) => e.into(),
        }
    }
}

impl From<RemoteError> for InstallError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Network(_) | RemoteError::Timeout => InstallError::NetworkUnavailable,
            RemoteError::Unauthorized | RemoteError::InvalidCredentials => InstallError::AuthRequired,
            other => InstallError::ServiceError(other.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for InstallError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => io.into(),
            other => InstallError::Filesystem(other.to_string()),
        }
    }
}

/// Launch errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("title is not installed")]
    NotInstalled,

    #[error("executable is missing: {0}")]
    ExecutableMissing(PathBuf),

    #[error("failed to launch: {0}")]
    LaunchFailed(String),

    #[error("unknown title: {0}")]
    UnknownTitle(String),

    #[error("no usable runner: {0}")]
    RunnerUnavailable(String),
}

/// Action the user can take after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Try the same operation again
    Retry,
    /// Log in again, then retry
    Reauthenticate,
    /// Free disk space, then retry
    FreeSpaceAndRetry,
}

/// Presentation of an error to the view layer
pub trait UserFacing {
    /// Short human-readable message
    fn user_message(&self) -> String;

    /// Optional follow-up the user can take
    fn retry_action(&self) -> Option<RetryAction>;

    /// Whether the outcome should be presented as an error at all
    fn is_error(&self) -> bool {
        true
    }
}

impl UserFacing for AuthError {
    fn user_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Login or password are wrong".to_string(),
            AuthError::NetworkUnavailable => {
                "Network error. Please check your internet connection.".to_string()
            }
            AuthError::ServiceError(_) => "Server error. Please try again later.".to_string(),
            AuthError::Expired => "Your session has expired. Please log in again.".to_string(),
            AuthError::NotAuthenticated => "Please log in first.".to_string(),
        }
    }

    fn retry_action(&self) -> Option<RetryAction> {
        match self {
            AuthError::InvalidCredentials => None,
            AuthError::NetworkUnavailable | AuthError::ServiceError(_) => Some(RetryAction::Retry),
            AuthError::Expired | AuthError::NotAuthenticated => Some(RetryAction::Reauthenticate),
        }
    }
}

impl UserFacing for SyncError {
    fn user_message(&self) -> String {
        match self {
            SyncError::NetworkUnavailable => {
                "Could not refresh the library. Showing the last known games.".to_string()
            }
            SyncError::ServiceError(_) => "Server error. Please try again later.".to_string(),
            SyncError::AuthRequired => "Please log in to refresh your library.".to_string(),
        }
    }

    fn retry_action(&self) -> Option<RetryAction> {
        match self {
            SyncError::AuthRequired => Some(RetryAction::Reauthenticate),
            _ => Some(RetryAction::Retry),
        }
    }
}

impl UserFacing for InstallError {
    fn user_message(&self) -> String {
        match self {
            InstallError::NetworkUnavailable => "Download failed: network unavailable.".to_string(),
            InstallError::DiskFull => "Not enough disk space to install this game.".to_string(),
            InstallError::CorruptArtifact => "The download was corrupted.".to_string(),
            InstallError::PermissionDenied => {
                "Cannot write to the installation directory.".to_string()
            }
            InstallError::Cancelled => "Installation cancelled.".to_string(),
            InstallError::AuthRequired => "Please log in to install games.".to_string(),
            InstallError::ServiceError(_) => "Server error. Please try again later.".to_string(),
            InstallError::Filesystem(msg) => format!("Installation failed: {}", msg),
            InstallError::UnknownTitle(_) => "This game is not in your library.".to_string(),
            InstallError::AlreadyInstalled => "This game is already installed.".to_string(),
            InstallError::NotInstalled => "This game is not installed.".to_string(),
            InstallError::TargetInUse(path) => {
                format!("{} is used by another installation.", path.display())
            }
            InstallError::TargetNotEmpty(path) => format!("{} is not empty.", path.display()),
            InstallError::Busy => "Wait for the current installation to finish.".to_string(),
        }
    }

    fn retry_action(&self) -> Option<RetryAction> {
        match self {
            InstallError::NetworkUnavailable
            | InstallError::CorruptArtifact
            | InstallError::ServiceError(_) => Some(RetryAction::Retry),
            InstallError::DiskFull => Some(RetryAction::FreeSpaceAndRetry),
            InstallError::AuthRequired => Some(RetryAction::Reauthenticate),
            _ => None,
        }
    }

    fn is_error(&self) -> bool {
        !matches!(self, InstallError::Cancelled)
    }
}

impl UserFacing for LaunchError {
    fn user_message(&self) -> String {
        match self {
            LaunchError::NotInstalled => "Install the game before playing.".to_string(),
            LaunchError::ExecutableMissing(_) => {
                "The game files are incomplete. Please reinstall the game.".to_string()
            }
            LaunchError::LaunchFailed(msg) => format!("Could not start the game: {}", msg),
            LaunchError::UnknownTitle(_) => "This game is not in your library.".to_string(),
            LaunchError::RunnerUnavailable(_) => {
                "No runner can start this game. Check its Wine or Proton setting.".to_string()
            }
        }
    }

    fn retry_action(&self) -> Option<RetryAction> {
        match self {
            LaunchError::LaunchFailed(_) => Some(RetryAction::Retry),
            _ => None,
        }
    }
}
