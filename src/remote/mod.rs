//! Contracts of the remote collaborators the core depends on.
//!
//! The remote service is third-party, so the core only relies on these traits;
//! `http` provides the reqwest-backed implementation.

pub mod http;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

pub use http::HttpRemote;

/// Credentials presented to the identity service
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Username/email and password
    Password { identifier: String, secret: String },
    /// Authorization code obtained from the OAuth login page
    AuthorizationCode(String),
}

/// Tokens issued by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) after which the access token is rejected
    pub expires_at: Option<i64>,
    pub user_id: Option<String>,
}

impl AuthToken {
    /// Whether the access token has passed its expiry
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => chrono::Utc::now().timestamp() >= expires_at,
            None => false,
        }
    }
}

/// Title metadata as listed by the catalog service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleMetadata {
    pub id: String,
    pub name: String,
    pub metadata_version: String,
    pub size_bytes: u64,
}

/// Download manifest of a title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    pub download_url: String,
    /// Hex SHA-256 of the artifact, optionally prefixed with `sha256:`
    pub checksum: String,
    pub size_bytes: u64,
    /// Version of the content, recorded in the install manifest
    #[serde(default)]
    pub version: Option<String>,
    /// Artifact file name, used when the artifact is not an archive
    #[serde(default)]
    pub file_name: Option<String>,
    /// Primary executable relative to the install directory
    #[serde(default)]
    pub executable: Option<String>,
}

/// Chunked body of a download
pub struct ByteStream {
    /// Offset the server actually started at; 0 when the range was ignored
    pub offset: u64,
    pub chunks: BoxStream<'static, Result<Vec<u8>, RemoteError>>,
}

/// Identity service: issues and refreshes tokens
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken, RemoteError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthToken, RemoteError>;
}

/// Catalog service: lists the titles owned by the user
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn list_owned_titles(&self, access_token: &str) -> Result<Vec<TitleMetadata>, RemoteError>;
}

/// Content delivery service: manifests and artifact bytes
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn fetch_manifest(
        &self,
        access_token: &str,
        title_id: &str,
    ) -> Result<ContentManifest, RemoteError>;

    /// Stream the artifact starting at `range_start`
    async fn stream_bytes(
        &self,
        access_token: &str,
        download_url: &str,
        range_start: u64,
    ) -> Result<ByteStream, RemoteError>;
}
