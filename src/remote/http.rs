use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{
    AuthToken, ByteStream, CatalogService, ContentManifest, ContentService, Credentials,
    IdentityService, TitleMetadata,
};
use crate::config::ServiceConfig;
use crate::error::RemoteError;

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    user_id: Option<String>,
}

/// OAuth error response
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Owned title as listed by the library endpoint
#[derive(Debug, Deserialize)]
struct WireTitle {
    id: String,
    title: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    size: u64,
}

/// Download link resolution response
#[derive(Debug, Deserialize)]
struct WireManifest {
    downlink: String,
    checksum: String,
    size: u64,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    executable: Option<String>,
}

/// reqwest-backed implementation of the identity, catalog and content services
#[derive(Clone)]
pub struct HttpRemote {
    config: ServiceConfig,
    client: Client,
    timeout: Duration,
}

impl HttpRemote {
    /// Create a new client with a per-request timeout
    pub fn new(config: ServiceConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("galaxy-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Service(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            timeout,
        })
    }

    /// Resolve a download link returned by the API
    ///
    /// The API may return protocol-relative (`//cdn...`) or relative links.
    fn resolve_url(&self, link: &str) -> Result<String, RemoteError> {
        if let Some(rest) = link.strip_prefix("//") {
            return Ok(format!("https://{}", rest));
        }

        let base = Url::parse(&self.config.api_url)
            .map_err(|e| RemoteError::Service(format!("invalid API URL: {}", e)))?;
        let resolved = base
            .join(link)
            .map_err(|e| RemoteError::Service(format!("invalid download link {}: {}", link, e)))?;

        Ok(resolved.to_string())
    }

    /// Create authorization headers for API requests
    fn auth_headers(&self, access_token: &str) -> Result<header::HeaderMap, RemoteError> {
        let mut headers = header::HeaderMap::new();

        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|_| RemoteError::Unauthorized)?,
        );
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    /// Send a request with the configured timeout
    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)
    }

    /// Exchange a grant for tokens at the token endpoint
    async fn request_token(&self, grant: &[(&str, &str)]) -> Result<AuthToken, RemoteError> {
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        params.extend_from_slice(grant);

        let response = self
            .send(self.client.post(&self.config.auth_url).form(&params))
            .await?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        // Error responses carry an OAuth error code regardless of the status
        if let Ok(error) = serde_json::from_str::<TokenErrorResponse>(&body) {
            debug!("Token endpoint returned error {}", error.error);
            return Err(match error.error.as_str() {
                "invalid_grant" | "invalid_client" | "unauthorized_client" => {
                    RemoteError::InvalidCredentials
                }
                _ => RemoteError::Service(
                    error.error_description.unwrap_or(error.error),
                ),
            });
        }

        if !status.is_success() {
            return Err(status_error(status));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Service(format!("invalid token response: {}", e)))?;

        if token.access_token.is_empty() {
            return Err(RemoteError::Service("Invalid response from server".to_string()));
        }

        Ok(AuthToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs),
            user_id: token.user_id,
        })
    }

    /// Execute an authorized GET and parse its JSON body
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        access_token: &str,
        path: &str,
    ) -> Result<T, RemoteError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        let headers = self.auth_headers(access_token)?;

        let response = self.send(self.client.get(&url).headers(headers)).await?;

        if !response.status().is_success() {
            let status = response.status();
            warn!("API request to {} failed: {}", path, status);
            return Err(status_error(status));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::Service(format!("failed to parse {} response: {}", path, e)))
    }
}

#[async_trait]
impl IdentityService for HttpRemote {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken, RemoteError> {
        match credentials {
            Credentials::Password { identifier, secret } => {
                info!("Requesting token with password grant");
                self.request_token(&[
                    ("grant_type", "password"),
                    ("username", identifier.as_str()),
                    ("password", secret.as_str()),
                ])
                .await
            }
            Credentials::AuthorizationCode(code) => {
                info!("Requesting token with authorization code grant");
                self.request_token(&[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", self.config.redirect_uri.as_str()),
                ])
                .await
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthToken, RemoteError> {
        info!("Refreshing access token");
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

#[async_trait]
impl CatalogService for HttpRemote {
    async fn list_owned_titles(&self, access_token: &str) -> Result<Vec<TitleMetadata>, RemoteError> {
        let titles: Vec<WireTitle> = self.get_json(access_token, "library/titles").await?;

        info!("Catalog service listed {} owned titles", titles.len());

        Ok(titles
            .into_iter()
            .map(|t| TitleMetadata {
                id: t.id,
                name: t.title,
                metadata_version: t.version.unwrap_or_else(|| "0".to_string()),
                size_bytes: t.size,
            })
            .collect())
    }
}

#[async_trait]
impl ContentService for HttpRemote {
    async fn fetch_manifest(
        &self,
        access_token: &str,
        title_id: &str,
    ) -> Result<ContentManifest, RemoteError> {
        let wire: WireManifest = self
            .get_json(access_token, &format!("titles/{}/manifest", title_id))
            .await?;

        Ok(ContentManifest {
            download_url: self.resolve_url(&wire.downlink)?,
            checksum: wire.checksum,
            size_bytes: wire.size,
            version: wire.version,
            file_name: wire.file_name,
            executable: wire.executable,
        })
    }

    async fn stream_bytes(
        &self,
        access_token: &str,
        download_url: &str,
        range_start: u64,
    ) -> Result<ByteStream, RemoteError> {
        let headers = self.auth_headers(access_token)?;
        let mut request = self.client.get(download_url).headers(headers);
        if range_start > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", range_start));
        }

        // Only the response head is bounded; the downloader bounds every chunk read
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(map_reqwest_error)?;

        let offset = match response.status() {
            StatusCode::PARTIAL_CONTENT => range_start,
            StatusCode::OK => {
                if range_start > 0 {
                    warn!("Server ignored range request, restarting download from 0");
                }
                0
            }
            StatusCode::RANGE_NOT_SATISFIABLE => return Err(RemoteError::RangeNotSatisfiable),
            status => return Err(status_error(status)),
        };

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_reqwest_error))
            .boxed();

        Ok(ByteStream { offset, chunks })
    }
}

/// Map an unsuccessful HTTP status to a remote error
fn status_error(status: StatusCode) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            RemoteError::Network(format!("service unavailable ({})", status))
        }
        status => RemoteError::Service(format!("unexpected status {}", status)),
    }
}

/// Map a transport error to a remote error
fn map_reqwest_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() {
        RemoteError::Network(e.to_string())
    } else if e.is_decode() {
        RemoteError::Service(e.to_string())
    } else {
        RemoteError::Network(e.to_string())
    }
}
