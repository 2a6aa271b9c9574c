use log::{error, info, warn};
use std::path::PathBuf;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::state::InstallState;
use crate::error::InstallError;

/// Progress of one title's install job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub title_id: String,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub state: InstallState,
}

/// Read-only view of an install job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub title_id: String,
    pub state: InstallState,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub cancel_requested: bool,
    pub error: Option<InstallError>,
    /// Directory the title is installed into
    pub install_path: PathBuf,
}

/// Handle to an install job
///
/// Clones observe the same job. Cancelling through any clone is equivalent
/// to cancelling through the pipeline.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    cancel: CancellationToken,
    snapshot: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    /// Pipeline-unique id of the job
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn title_id(&self) -> String {
        self.snapshot.borrow().title_id.clone()
    }

    /// Current state of the job
    pub fn snapshot(&self) -> JobSnapshot {
        let mut snapshot = self.snapshot.borrow().clone();
        snapshot.cancel_requested |= self.cancel.is_cancelled();
        snapshot
    }

    /// Request cancellation; honoured at the next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobSnapshot {
        let mut rx = self.snapshot.clone();
        loop {
            if rx.borrow_and_update().state.is_terminal() {
                break;
            }
            // The worker is gone; its last snapshot is final
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.snapshot()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for JobHandle {}

/// Worker side of a job: the only writer of its snapshot
///
/// Every change is published to the handle's snapshot; progress events are
/// throttled and never go backwards in bytes.
pub(crate) struct JobReporter {
    snapshot: watch::Sender<JobSnapshot>,
    events: broadcast::Sender<ProgressEvent>,
    step_percent: u8,
    last_emitted: Option<u64>,
}

impl JobReporter {
    /// Create a queued job and its handle
    pub fn new(
        id: u64,
        title_id: &str,
        install_path: PathBuf,
        bytes_total: u64,
        step_percent: u8,
        events: broadcast::Sender<ProgressEvent>,
    ) -> (Self, JobHandle) {
        let (snapshot, rx) = watch::channel(JobSnapshot {
            title_id: title_id.to_string(),
            state: InstallState::Queued,
            bytes_downloaded: 0,
            bytes_total,
            cancel_requested: false,
            error: None,
            install_path,
        });

        let reporter = Self {
            snapshot,
            events,
            step_percent,
            last_emitted: None,
        };
        let handle = JobHandle {
            id,
            cancel: CancellationToken::new(),
            snapshot: rx,
        };

        (reporter, handle)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Publish the initial queued event
    pub fn announce(&mut self) {
        info!("Queued install of {}", self.snapshot.borrow().title_id);
        self.emit();
    }

    /// Size of the artifact, once the manifest is known
    pub fn set_total(&mut self, bytes_total: u64) {
        self.snapshot.send_modify(|s| s.bytes_total = bytes_total);
    }

    /// Move the job to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: InstallState) -> bool {
        let current = self.snapshot.borrow().state.clone();
        let title_id = self.snapshot.borrow().title_id.clone();

        match current.transition(next) {
            Ok(next) => {
                info!("Install of {}: {}", title_id, next);
                self.snapshot.send_modify(|s| {
                    if let InstallState::Failed(e) = &next {
                        s.error = Some(e.clone());
                    }
                    if next == InstallState::Cancelled {
                        s.cancel_requested = true;
                    }
                    s.state = next;
                });
                self.emit();
                true
            }
            Err(e) => {
                error!("Install of {}: {}", title_id, e);
                false
            }
        }
    }

    /// Record downloaded bytes and emit an event when the step is reached
    pub fn progress(&mut self, bytes_downloaded: u64) {
        self.snapshot.send_modify(|s| s.bytes_downloaded = bytes_downloaded);

        let total = self.snapshot.borrow().bytes_total;
        let step = (total * u64::from(self.step_percent) / 100).max(1);
        let due = match self.last_emitted {
            Some(last) => {
                bytes_downloaded >= last.saturating_add(step)
                    || (bytes_downloaded == total && bytes_downloaded > last)
            }
            None => true,
        };

        if due {
            self.emit();
        }
    }

    fn emit(&mut self) {
        let snapshot = self.snapshot.borrow().clone();

        // A server restarting a resumed download must not move observers backwards
        let bytes_downloaded = match self.last_emitted {
            Some(last) => snapshot.bytes_downloaded.max(last),
            None => snapshot.bytes_downloaded,
        };
        self.last_emitted = Some(bytes_downloaded);

        let event = ProgressEvent {
            title_id: snapshot.title_id,
            bytes_downloaded,
            bytes_total: snapshot.bytes_total,
            state: snapshot.state,
        };

        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Progress events of a single title
pub struct ProgressSubscription {
    title_id: String,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    pub(crate) fn new(title_id: &str, rx: broadcast::Receiver<ProgressEvent>) -> Self {
        Self {
            title_id: title_id.to_string(),
            rx,
        }
    }

    /// Next event for the title; `None` once the pipeline is gone
    ///
    /// A slow subscriber skips events it missed and continues with the
    /// newest ones.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.title_id == self.title_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Progress subscriber for {} lagged, skipped {} events",
                        self.title_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
