//! Authenticators: the per-backend owners of credential and token state

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::errors::{incorrect_use, Result};
use super::model::ServerCredentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    NoAuth,
    /// Redirect based flow completed outside the process (OAuth)
    External,
    /// Direct username/password login
    Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    /// Last credentials were refused by the server; behaves as
    /// `Unauthenticated` until new credentials arrive
    CredentialsRejected,
}

/// An external authorization in progress.
///
/// `completion` resolves once [`FileSystemAuthenticator::complete_external_auth`]
/// has exchanged the redirect code, or with an error if the exchange failed.
#[derive(Debug)]
pub struct PendingAuthorization {
    pub authorize_url: String,
    pub completion: oneshot::Receiver<Result<()>>,
}

pub trait FileSystemAuthenticator: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn state(&self) -> AuthState;

    fn is_authentication_required(&self) -> bool;

    /// Replace the credentials; moves to `Authenticating` until the next backend call.
    ///
    /// Panics for authenticators that do not log in with credentials.
    fn set_credentials(&self, credentials: ServerCredentials);

    fn credentials(&self) -> Option<ServerCredentials>;

    fn start_external_auth(&self) -> Result<PendingAuthorization> {
        incorrect_use(format!(
            "{:?} authenticator does not support external authentication",
            self.auth_type()
        ))
    }

    fn complete_external_auth(&self, _code: &str) -> Result<()> {
        incorrect_use(format!(
            "{:?} authenticator does not support external authentication",
            self.auth_type()
        ))
    }

    /// Bearer token for token-based backends
    fn auth_token(&self) -> Option<String> {
        None
    }

    /// The backend refused the current credentials or token
    fn on_credentials_rejected(&self);

    /// A backend call succeeded with the current credentials
    fn on_authenticated(&self);
}

/// Authenticator of backends with nothing to log into
#[derive(Debug, Default)]
pub struct NoAuthAuthenticator;

impl NoAuthAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystemAuthenticator for NoAuthAuthenticator {
    fn auth_type(&self) -> AuthType {
        AuthType::NoAuth
    }

    fn state(&self) -> AuthState {
        AuthState::Authenticated
    }

    fn is_authentication_required(&self) -> bool {
        false
    }

    fn set_credentials(&self, _credentials: ServerCredentials) {
        incorrect_use("credentials can not be set on a backend without authentication")
    }

    fn credentials(&self) -> Option<ServerCredentials> {
        None
    }

    fn on_credentials_rejected(&self) {}

    fn on_authenticated(&self) {}
}

#[derive(Debug)]
struct CredentialsState {
    credentials: Option<ServerCredentials>,
    state: AuthState,
}

/// Username/password (or SSH key) login, used by WebDAV and Git.
///
/// Credentials sit behind an `RwLock`: request paths read them concurrently,
/// state transitions take the write lock.
#[derive(Debug)]
pub struct CredentialsAuthenticator {
    inner: RwLock<CredentialsState>,
}

impl CredentialsAuthenticator {
    pub fn new(credentials: Option<ServerCredentials>) -> Self {
        let state = if credentials.is_some() {
            AuthState::Authenticating
        } else {
            AuthState::Unauthenticated
        };
        Self {
            inner: RwLock::new(CredentialsState { credentials, state }),
        }
    }
}

impl FileSystemAuthenticator for CredentialsAuthenticator {
    fn auth_type(&self) -> AuthType {
        AuthType::Credentials
    }

    fn state(&self) -> AuthState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    fn is_authentication_required(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.credentials.is_none()
            || matches!(inner.state, AuthState::Unauthenticated | AuthState::CredentialsRejected)
    }

    fn set_credentials(&self, credentials: ServerCredentials) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        log::info!("Credentials updated for {}", credentials.server_url());
        inner.credentials = Some(credentials);
        inner.state = AuthState::Authenticating;
    }

    fn credentials(&self) -> Option<ServerCredentials> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credentials
            .clone()
    }

    fn on_credentials_rejected(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.state != AuthState::CredentialsRejected {
            log::warn!(
                "Credentials rejected by {}",
                inner.credentials.as_ref().map(|c| c.server_url()).unwrap_or("server")
            );
        }
        inner.state = AuthState::CredentialsRejected;
    }

    fn on_authenticated(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.state != AuthState::Authenticated && inner.credentials.is_some() {
            log::debug!("Authenticated");
            inner.state = AuthState::Authenticated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_state_machine() {
        let auth = CredentialsAuthenticator::new(None);
        assert_eq!(auth.state(), AuthState::Unauthenticated);
        assert!(auth.is_authentication_required());

        auth.set_credentials(ServerCredentials::basic("https://dav.example.com", "alice", "pw"));
        assert_eq!(auth.state(), AuthState::Authenticating);
        assert!(!auth.is_authentication_required());

        auth.on_authenticated();
        assert_eq!(auth.state(), AuthState::Authenticated);

        auth.on_credentials_rejected();
        assert_eq!(auth.state(), AuthState::CredentialsRejected);
        assert!(auth.is_authentication_required());

        auth.set_credentials(ServerCredentials::basic("https://dav.example.com", "alice", "pw2"));
        assert_eq!(auth.state(), AuthState::Authenticating);
    }

    #[test]
    fn test_authenticated_requires_credentials() {
        let auth = CredentialsAuthenticator::new(None);
        auth.on_authenticated();
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_credentials_authenticator_rejects_external_flow() {
        let auth = CredentialsAuthenticator::new(None);
        let _ = auth.start_external_auth();
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_no_auth_rejects_credentials() {
        NoAuthAuthenticator::new().set_credentials(ServerCredentials::basic("u", "n", "p"));
    }
}
