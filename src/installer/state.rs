use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::InstallError;

/// Installation state of a title
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstallState {
    #[default]
    NotInstalled,
    Queued,
    Downloading,
    Verifying,
    Installing,
    Installed,
    Cancelled,
    Failed(InstallError),
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal install transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: InstallState,
    pub to: InstallState,
}

impl InstallState {
    /// A job in this state is still running or waiting to run
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstallState::Queued
                | InstallState::Downloading
                | InstallState::Verifying
                | InstallState::Installing
        )
    }

    /// Last state of a job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallState::Installed | InstallState::Cancelled | InstallState::Failed(_)
        )
    }

    /// Whether `next` is reachable from this state in one step
    pub fn can_transition_to(&self, next: &InstallState) -> bool {
        use InstallState::*;

        match (self, next) {
            (NotInstalled, Queued) => true,
            (Queued, Downloading) => true,
            (Downloading, Verifying) => true,
            (Verifying, Installing) => true,
            (Installing, Installed) => true,
            (from, Cancelled) | (from, Failed(_)) => from.is_active(),
            // dismiss
            (Cancelled, NotInstalled) | (Failed(_), NotInstalled) => true,
            // uninstall
            (Installed, NotInstalled) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(self, next: InstallState) -> Result<InstallState, IllegalTransition> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallState::NotInstalled => write!(f, "not installed"),
            InstallState::Queued => write!(f, "queued"),
            InstallState::Downloading => write!(f, "downloading"),
            InstallState::Verifying => write!(f, "verifying"),
            InstallState::Installing => write!(f, "installing"),
            InstallState::Installed => write!(f, "installed"),
            InstallState::Cancelled => write!(f, "cancelled"),
            InstallState::Failed(e) => write!(f, "failed ({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        let state = InstallState::NotInstalled
            .transition(InstallState::Queued)
            .and_then(|s| s.transition(InstallState::Downloading))
            .and_then(|s| s.transition(InstallState::Verifying))
            .and_then(|s| s.transition(InstallState::Installing))
            .and_then(|s| s.transition(InstallState::Installed))
            .unwrap();
        assert_eq!(state, InstallState::Installed);
    }

    #[test]
    fn installed_cannot_restart_download() {
        let err = InstallState::Installed
            .transition(InstallState::Downloading)
            .unwrap_err();
        assert_eq!(err.from, InstallState::Installed);
        assert_eq!(err.to, InstallState::Downloading);

        // uninstall first, then queue again
        let state = InstallState::Installed
            .transition(InstallState::NotInstalled)
            .and_then(|s| s.transition(InstallState::Queued))
            .unwrap();
        assert_eq!(state, InstallState::Queued);
    }

    #[test]
    fn only_active_states_can_be_cancelled_or_failed() {
        for state in [
            InstallState::Queued,
            InstallState::Downloading,
            InstallState::Verifying,
            InstallState::Installing,
        ] {
            assert!(state.can_transition_to(&InstallState::Cancelled));
            assert!(state.can_transition_to(&InstallState::Failed(InstallError::DiskFull)));
        }

        assert!(!InstallState::Installed.can_transition_to(&InstallState::Cancelled));
        assert!(!InstallState::NotInstalled.can_transition_to(&InstallState::Cancelled));
        assert!(!InstallState::Cancelled
            .can_transition_to(&InstallState::Failed(InstallError::NetworkUnavailable)));
    }

    #[test]
    fn terminal_failures_are_dismissible() {
        let failed = InstallState::Failed(InstallError::CorruptArtifact);
        assert!(failed.is_terminal());
        assert_eq!(
            failed.transition(InstallState::NotInstalled).unwrap(),
            InstallState::NotInstalled
        );
        assert!(!InstallState::Cancelled.can_transition_to(&InstallState::Queued));
    }
}
