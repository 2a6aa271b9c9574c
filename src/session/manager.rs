use log::{info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::credentials::CredentialStore;
use crate::error::{AuthError, AuthorizedError, RemoteError};
use crate::remote::{AuthToken, Credentials, IdentityService};

/// Authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Expired,
}

/// Snapshot of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    pub token: Option<AuthToken>,
    pub user_id: Option<String>,
}

impl Session {
    fn anonymous() -> Self {
        Self {
            state: SessionState::Anonymous,
            token: None,
            user_id: None,
        }
    }

    /// Whether authenticated calls can be made right now
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }
}

/// Owns the authentication state and the token
///
/// The session lives in a watch channel: readers take a snapshot without
/// blocking and the view layer subscribes to state changes. Login and refresh
/// are serialized so a burst of expired calls triggers a single refresh.
pub struct SessionManager {
    identity: Arc<dyn IdentityService>,
    store: Arc<dyn CredentialStore>,
    session: watch::Sender<Session>,
    auth_lock: Mutex<()>,
}

impl SessionManager {
    /// Create an anonymous session manager
    pub fn new(identity: Arc<dyn IdentityService>, store: Arc<dyn CredentialStore>) -> Self {
        let (session, _) = watch::channel(Session::anonymous());

        Self {
            identity,
            store,
            session,
            auth_lock: Mutex::new(()),
        }
    }

    /// Restore a persisted session from the credential store
    pub fn restore(&self) -> Session {
        let token = match self.store.load() {
            Ok(Some(token)) => token,
            Ok(None) => return self.current_session(),
            Err(e) => {
                warn!("Failed to load stored session: {}", e);
                return self.current_session();
            }
        };

        let state = if token.is_expired() {
            info!("Restored session has expired, it will be refreshed on first use");
            SessionState::Expired
        } else {
            info!("Restored session");
            SessionState::Authenticated
        };

        let session = Session {
            state,
            user_id: token.user_id.clone(),
            token: Some(token),
        };
        self.session.send_replace(session.clone());
        session
    }

    /// Current session; never blocks
    pub fn current_session(&self) -> Session {
        self.session.borrow().clone()
    }

    /// Observe session state changes
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    /// Log in with username and password
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, AuthError> {
        if identifier.trim().is_empty() || secret.is_empty() {
            warn!("Login rejected: username and password are both required");
            return Err(AuthError::InvalidCredentials);
        }

        self.authenticate(Credentials::Password {
            identifier: identifier.trim().to_string(),
            secret: secret.to_string(),
        })
        .await
    }

    /// Log in with an authorization code from the OAuth login page
    pub async fn login_with_oauth(&self, auth_code: &str) -> Result<Session, AuthError> {
        if auth_code.trim().is_empty() {
            warn!("Login rejected: empty authorization code");
            return Err(AuthError::InvalidCredentials);
        }

        self.authenticate(Credentials::AuthorizationCode(auth_code.trim().to_string()))
            .await
    }

    /// Drop the session and the stored token
    pub fn logout(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear stored session: {}", e);
        }
        self.session.send_replace(Session::anonymous());
        info!("Logged out");
    }

    /// Exchange the refresh token for a new access token
    ///
    /// On failure the session becomes anonymous and the caller must log in again.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let _guard = self.auth_lock.lock().await;

        let current = self.current_session();

        // Another caller may have refreshed while we waited for the lock
        if current.state == SessionState::Authenticated {
            if let Some(token) = &current.token {
                if !token.is_expired() {
                    return Ok(current);
                }
            }
        }

        let previous = match current.token {
            Some(token) => token,
            None => return Err(AuthError::NotAuthenticated),
        };
        let refresh_token = match previous.refresh_token.clone() {
            Some(refresh_token) => refresh_token,
            None => {
                warn!("Session expired without a refresh token");
                self.logout();
                return Err(AuthError::Expired);
            }
        };

        match self.identity.refresh(&refresh_token).await {
            Ok(mut token) => {
                if token.refresh_token.is_none() {
                    token.refresh_token = Some(refresh_token);
                }
                if token.user_id.is_none() {
                    token.user_id = previous.user_id;
                }
                info!("Session refreshed");
                Ok(self.establish(token))
            }
            Err(e) => {
                warn!("Session refresh failed: {}", e);
                self.logout();
                Err(AuthError::Expired)
            }
        }
    }

    /// Access token for an authenticated call, refreshing an expired session once
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let session = self.current_session();

        match (session.state, session.token) {
            (SessionState::Authenticated, Some(token)) => {
                if !token.is_expired() {
                    return Ok(token.access_token);
                }
                self.mark_expired(&token.access_token);
            }
            (SessionState::Expired, Some(_)) => {}
            _ => return Err(AuthError::NotAuthenticated),
        }

        let refreshed = self.refresh().await?;
        refreshed
            .token
            .map(|token| token.access_token)
            .ok_or(AuthError::Expired)
    }

    /// Run a collaborator call with the current token
    ///
    /// A rejected token marks the session expired; the call is retried once
    /// after a refresh.
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, AuthorizedError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let token = self.access_token().await?;

        match op(token.clone()).await {
            Err(RemoteError::Unauthorized) => {
                info!("Access token rejected, refreshing session");
                self.mark_expired(&token);
                let token = self.access_token().await?;
                Ok(op(token).await?)
            }
            other => Ok(other?),
        }
    }

    /// Mark the session expired if it still uses `access_token`
    pub fn mark_expired(&self, access_token: &str) {
        self.session.send_if_modified(|session| {
            let matches = session
                .token
                .as_ref()
                .map_or(false, |t| t.access_token == access_token);
            if matches && session.state == SessionState::Authenticated {
                session.state = SessionState::Expired;
                info!("Session expired");
                true
            } else {
                false
            }
        });
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Session, AuthError> {
        let _guard = self.auth_lock.lock().await;

        let previous = self.current_session();
        self.session.send_modify(|session| session.state = SessionState::Authenticating);

        match self.identity.authenticate(&credentials).await {
            Ok(token) => {
                info!("Login succeeded");
                Ok(self.establish(token))
            }
            Err(e) => {
                warn!("Login failed: {}", e);
                self.session.send_replace(previous);
                Err(match e {
                    RemoteError::Unauthorized => AuthError::InvalidCredentials,
                    other => other.into(),
                })
            }
        }
    }

    fn establish(&self, token: AuthToken) -> Session {
        if let Err(e) = self.store.save(&token) {
            warn!("Failed to persist session: {}", e);
        }

        let session = Session {
            state: SessionState::Authenticated,
            user_id: token.user_id.clone(),
            token: Some(token),
        };
        self.session.send_replace(session.clone());
        session
    }
}
