#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use galaxy_client::config::{Settings, SettingsStore};
use galaxy_client::error::RemoteError;
use galaxy_client::installer::{InstallState, ProgressEvent, ProgressSubscription};
use galaxy_client::remote::{
    AuthToken, ByteStream, CatalogService, ContentManifest, ContentService, Credentials,
    IdentityService, TitleMetadata,
};
use galaxy_client::session::{CredentialStore, MemoryCredentialStore};
use galaxy_client::{ClientContext, Services};

pub const USERNAME: &str = "player";
pub const PASSWORD: &str = "hunter2";

/// Accepts `player`/`hunter2`
#[derive(Default)]
pub struct FakeIdentity {
    pub calls: AtomicUsize,
}

#[async_trait]
impl IdentityService for FakeIdentity {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match credentials {
            Credentials::Password { identifier, secret }
                if identifier == USERNAME && secret == PASSWORD =>
            {
                Ok(AuthToken {
                    access_token: "access-1".to_string(),
                    refresh_token: Some("refresh-1".to_string()),
                    expires_at: None,
                    user_id: Some("user-1".to_string()),
                })
            }
            _ => Err(RemoteError::InvalidCredentials),
        }
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<AuthToken, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AuthToken {
            access_token: "access-2".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: None,
            user_id: Some("user-1".to_string()),
        })
    }
}

/// Owned titles served by the fake catalog service
#[derive(Default)]
pub struct FakeCatalog {
    pub titles: Mutex<Vec<TitleMetadata>>,
}

impl FakeCatalog {
    pub fn add(&self, id: &str, name: &str, size_bytes: u64) {
        self.titles.lock().unwrap().push(TitleMetadata {
            id: id.to_string(),
            name: name.to_string(),
            metadata_version: "1".to_string(),
            size_bytes,
        });
    }
}

#[async_trait]
impl CatalogService for FakeCatalog {
    async fn list_owned_titles(&self, _token: &str) -> Result<Vec<TitleMetadata>, RemoteError> {
        Ok(self.titles.lock().unwrap().clone())
    }
}

/// Artifact of one title
#[derive(Clone)]
pub struct Artifact {
    pub data: Vec<u8>,
    pub chunk_size: usize,
    pub checksum: String,
    pub file_name: Option<String>,
}

impl Artifact {
    pub fn new(data: Vec<u8>, chunk_size: usize, file_name: &str) -> Self {
        Self {
            checksum: sha256_hex(&data),
            data,
            chunk_size,
            file_name: Some(file_name.to_string()),
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Content delivery fake
///
/// Streams honour the requested range. `fail_streams` makes the next streams
/// break after their first chunk; `stall_opens` makes the next stream
/// requests never answer; `gate` holds streams after their first chunk until
/// notified.
#[derive(Default)]
pub struct FakeContent {
    pub artifacts: Mutex<HashMap<String, Artifact>>,
    pub fail_streams: AtomicU32,
    pub stall_opens: AtomicU32,
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub stream_starts: Mutex<Vec<u64>>,
}

impl FakeContent {
    pub fn add(&self, title_id: &str, artifact: Artifact) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(title_id.to_string(), artifact);
    }

    /// Hold every new stream after its first chunk
    pub fn close_gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    pub fn starts(&self) -> Vec<u64> {
        self.stream_starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentService for FakeContent {
    async fn fetch_manifest(
        &self,
        _token: &str,
        title_id: &str,
    ) -> Result<ContentManifest, RemoteError> {
        let artifacts = self.artifacts.lock().unwrap();
        let artifact = artifacts
            .get(title_id)
            .ok_or_else(|| RemoteError::Service("no such title".to_string()))?;

        Ok(ContentManifest {
            download_url: format!("https://cdn.test/{}", title_id),
            checksum: artifact.checksum.clone(),
            size_bytes: artifact.data.len() as u64,
            version: Some("1.0".to_string()),
            file_name: artifact.file_name.clone(),
            executable: None,
        })
    }

    async fn stream_bytes(
        &self,
        _token: &str,
        download_url: &str,
        range_start: u64,
    ) -> Result<ByteStream, RemoteError> {
        self.stream_starts.lock().unwrap().push(range_start);

        let stalled = self
            .stall_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            futures::future::pending::<()>().await;
        }

        let title_id = download_url.rsplit('/').next().unwrap_or_default();
        let artifact = self
            .artifacts
            .lock()
            .unwrap()
            .get(title_id)
            .cloned()
            .ok_or_else(|| RemoteError::Service("no such artifact".to_string()))?;

        let start = (range_start as usize).min(artifact.data.len());
        let mut chunks: Vec<Result<Vec<u8>, RemoteError>> = artifact.data[start..]
            .chunks(artifact.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        let failing = self
            .fail_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            chunks.truncate(1);
            chunks.push(Err(RemoteError::Network("connection reset".to_string())));
        }

        let gate = self.gate.lock().unwrap().clone();
        let chunks = match gate {
            Some(gate) if chunks.len() > 1 => {
                let rest = chunks.split_off(1);
                stream::iter(chunks)
                    .chain(
                        stream::once(async move {
                            gate.notified().await;
                            stream::iter(rest)
                        })
                        .flatten(),
                    )
                    .boxed()
            }
            _ => stream::iter(chunks).boxed(),
        };

        Ok(ByteStream {
            offset: start as u64,
            chunks,
        })
    }
}

/// Client wired to fakes in a temporary directory
pub struct Harness {
    pub dir: TempDir,
    pub ctx: ClientContext,
    pub identity: Arc<FakeIdentity>,
    pub catalog: Arc<FakeCatalog>,
    pub content: Arc<FakeContent>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Harness {
    /// Empty client, not logged in
    pub fn new(configure: impl FnOnce(&mut Settings)) -> Self {
        Self::with_parts(
            tempfile::tempdir().unwrap(),
            Arc::new(FakeCatalog::default()),
            Arc::new(FakeContent::default()),
            Arc::new(MemoryCredentialStore::new()),
            configure,
        )
    }

    pub fn with_parts(
        dir: TempDir,
        catalog: Arc<FakeCatalog>,
        content: Arc<FakeContent>,
        credentials: Arc<dyn CredentialStore>,
        configure: impl FnOnce(&mut Settings),
    ) -> Self {
        let mut settings = Settings::portable(dir.path());
        settings.downloads.retry_base_delay_ms = 1;
        configure(&mut settings);

        let identity = Arc::new(FakeIdentity::default());
        let ctx = ClientContext::with_services(
            Arc::new(SettingsStore::in_memory(settings)),
            Services {
                identity: identity.clone(),
                catalog: catalog.clone(),
                content: content.clone(),
                credentials: credentials.clone(),
            },
        )
        .unwrap();

        Self {
            dir,
            ctx,
            identity,
            catalog,
            content,
            credentials,
        }
    }

    /// Logged-in client whose library holds `title-42`: a 1000-byte
    /// artifact delivered in two 500-byte chunks
    pub async fn with_title_42() -> Self {
        Self::with_title_42_and(|_| {}).await
    }

    pub async fn with_title_42_and(configure: impl FnOnce(&mut Settings)) -> Self {
        let harness = Self::new(configure);
        harness.catalog.add("title-42", "Title Forty-Two", 1000);
        harness
            .content
            .add("title-42", Artifact::new(vec![7u8; 1000], 500, "start.sh"));
        harness.login_and_sync().await;
        harness
    }

    pub async fn login_and_sync(&self) {
        self.ctx.login(USERNAME, PASSWORD).await.unwrap();
        self.ctx.sync_library().await.unwrap();
    }

    pub fn games_dir(&self) -> PathBuf {
        self.dir.path().join("games")
    }

    pub fn partial_file(&self, title_id: &str) -> PathBuf {
        self.dir.path().join("tmp").join(format!("{}.part", title_id))
    }
}

/// Next event, failing the test after a few seconds of silence
pub async fn next_event(progress: &mut ProgressSubscription) -> ProgressEvent {
    tokio::time::timeout(Duration::from_secs(10), progress.recv())
        .await
        .expect("no progress event within 10s")
        .expect("progress stream closed")
}

/// Events up to and including the terminal one
pub async fn collect_until_terminal(progress: &mut ProgressSubscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(progress).await;
        let done = event.state.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Wait until an event reaches `bytes` in state `state`
pub async fn wait_for_bytes(progress: &mut ProgressSubscription, bytes: u64, state: InstallState) {
    loop {
        let event = next_event(progress).await;
        if event.bytes_downloaded >= bytes && event.state == state {
            return;
        }
        assert!(!event.state.is_terminal(), "job ended early: {:?}", event);
    }
}
