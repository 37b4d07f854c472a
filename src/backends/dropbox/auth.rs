//! OAuth2 authorization-code flow with PKCE for Dropbox

use std::sync::{Arc, Mutex, PoisonError};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use reqwest::blocking::Client;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::config::{DropboxConfig, NetworkConfig};
use crate::encryption::crypto::sha256;
use crate::fs::{
    incorrect_use, AuthState, AuthType, FileSystemAuthenticator, FileSystemError, PendingAuthorization, Result,
    ServerCredentials,
};
use crate::settings::{Settings, DROPBOX_PENDING_VERIFIER};

const AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";
const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(sha256(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct PendingExchange {
    pkce: Pkce,
    completion: oneshot::Sender<Result<()>>,
}

struct DropboxAuthState {
    token: Option<String>,
    state: AuthState,
    pending: Option<PendingExchange>,
}

pub struct DropboxAuthenticator {
    app_key: String,
    redirect_uri: Option<String>,
    settings: Arc<dyn Settings>,
    http: Client,
    inner: Mutex<DropboxAuthState>,
}

impl DropboxAuthenticator {
    pub fn new(
        config: &DropboxConfig,
        network: &NetworkConfig,
        settings: Arc<dyn Settings>,
    ) -> std::result::Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(network.timeout())
            .connect_timeout(network.connect_timeout())
            .build()?;
        let token = settings.dropbox_auth_token();
        let state = if token.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };

        Ok(Self {
            app_key: config.app_key.clone(),
            redirect_uri: config.redirect_uri.clone(),
            settings,
            http,
            inner: Mutex::new(DropboxAuthState {
                token,
                state,
                pending: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DropboxAuthState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn authorize_url(&self, pkce: &Pkce) -> String {
        let mut url = format!(
            "{}?client_id={}&response_type=code&code_challenge={}&code_challenge_method=S256",
            AUTHORIZE_URL,
            urlencoding::encode(&self.app_key),
            pkce.challenge
        );
        if let Some(redirect) = &self.redirect_uri {
            url.push_str(&format!("&redirect_uri={}", urlencoding::encode(redirect)));
        }
        url
    }

    fn exchange_code(&self, code: &str, pkce: &Pkce) -> Result<String> {
        let mut form = vec![
            ("code", code.to_string()),
            ("grant_type", "authorization_code".to_string()),
            ("client_id", self.app_key.clone()),
            ("code_verifier", pkce.verifier.clone()),
        ];
        if let Some(redirect) = &self.redirect_uri {
            form.push(("redirect_uri", redirect.clone()));
        }

        log::info!("Dropbox: exchanging authorization code");
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .map_err(|e| FileSystemError::NetworkIo(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FileSystemError::NetworkIo(format!("token endpoint returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(FileSystemError::Authentication(format!(
                "authorization code rejected ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| FileSystemError::InvalidData(e.to_string()))?;
        Ok(token.access_token)
    }

    /// Store a freshly issued token in memory and settings
    pub(crate) fn accept_token(&self, token: &str) -> Result<()> {
        self.settings
            .set_dropbox_auth_token(Some(token))
            .map_err(|e| FileSystemError::InvalidData(e.to_string()))?;
        let mut inner = self.lock();
        inner.token = Some(token.to_string());
        inner.state = AuthState::Authenticated;
        log::info!("Dropbox: authenticated");
        Ok(())
    }

    fn current_token(&self) -> Option<String> {
        let mut inner = self.lock();
        if inner.token.is_none() && inner.state != AuthState::CredentialsRejected {
            inner.token = self.settings.dropbox_auth_token();
        }
        inner.token.clone()
    }
}

impl FileSystemAuthenticator for DropboxAuthenticator {
    fn auth_type(&self) -> AuthType {
        AuthType::External
    }

    fn state(&self) -> AuthState {
        self.lock().state
    }

    fn is_authentication_required(&self) -> bool {
        self.current_token().is_none()
    }

    fn set_credentials(&self, _credentials: ServerCredentials) {
        incorrect_use("Dropbox authenticates through the browser, not with credentials")
    }

    fn credentials(&self) -> Option<ServerCredentials> {
        None
    }

    fn start_external_auth(&self) -> Result<PendingAuthorization> {
        if self.app_key.is_empty() {
            return Err(FileSystemError::Authentication("Dropbox app key is not configured".to_string()));
        }

        let pkce = Pkce::generate();
        let authorize_url = self.authorize_url(&pkce);
        let (tx, rx) = oneshot::channel();

        // Kept so that a later process can finish the exchange
        if let Err(e) = self.settings.set_string(DROPBOX_PENDING_VERIFIER, Some(&pkce.verifier)) {
            log::warn!("Dropbox: failed to persist pending authorization: {}", e);
        }

        let mut inner = self.lock();
        if inner.pending.is_some() {
            log::debug!("Dropbox: replacing unfinished authorization");
        }
        inner.pending = Some(PendingExchange { pkce, completion: tx });
        inner.state = AuthState::Authenticating;

        Ok(PendingAuthorization {
            authorize_url,
            completion: rx,
        })
    }

    fn complete_external_auth(&self, code: &str) -> Result<()> {
        let pending = self.lock().pending.take();
        let pending = match pending {
            Some(pending) => pending,
            None => match self.settings.get_string(DROPBOX_PENDING_VERIFIER) {
                Some(verifier) => {
                    log::debug!("Dropbox: resuming authorization started earlier");
                    let (completion, _) = oneshot::channel();
                    PendingExchange {
                        pkce: Pkce::from_verifier(verifier),
                        completion,
                    }
                }
                None => incorrect_use("no Dropbox authorization was started"),
            },
        };

        let result = self
            .exchange_code(code.trim(), &pending.pkce)
            .and_then(|token| self.accept_token(&token));

        match &result {
            Ok(()) => {
                if let Err(e) = self.settings.set_string(DROPBOX_PENDING_VERIFIER, None) {
                    log::warn!("Dropbox: failed to clear pending authorization: {}", e);
                }
                let _ = pending.completion.send(Ok(()));
            }
            Err(e) => {
                log::warn!("Dropbox: authorization failed: {}", e);
                self.lock().state = AuthState::Unauthenticated;
                let _ = pending
                    .completion
                    .send(Err(FileSystemError::Authentication(e.to_string())));
            }
        }
        result
    }

    fn auth_token(&self) -> Option<String> {
        self.current_token()
    }

    fn on_credentials_rejected(&self) {
        let mut inner = self.lock();
        if inner.token.take().is_some() {
            log::warn!("Dropbox: token rejected, signing out");
        }
        inner.state = AuthState::CredentialsRejected;
        if let Err(e) = self.settings.set_dropbox_auth_token(None) {
            log::error!("Dropbox: failed to clear stored token: {}", e);
        }
    }

    fn on_authenticated(&self) {
        let mut inner = self.lock();
        if inner.token.is_some() {
            inner.state = AuthState::Authenticated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::InMemorySettings;

    fn authenticator(settings: Arc<InMemorySettings>) -> DropboxAuthenticator {
        let config = DropboxConfig {
            app_key: "app-key".to_string(),
            redirect_uri: None,
        };
        DropboxAuthenticator::new(&config, &NetworkConfig::default(), settings).unwrap()
    }

    #[test]
    fn test_pkce_challenge() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier.len(), 64);
        assert!(pkce
            .verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(pkce.challenge, URL_SAFE_NO_PAD.encode(sha256(pkce.verifier.as_bytes())));
        assert_eq!(pkce.challenge.len(), 43);
        assert_ne!(Pkce::generate().verifier, pkce.verifier);
    }

    #[test]
    fn test_start_external_auth() {
        let auth = authenticator(Arc::new(InMemorySettings::new()));
        assert!(auth.is_authentication_required());

        let pending = auth.start_external_auth().unwrap();
        assert!(pending.authorize_url.starts_with(AUTHORIZE_URL));
        assert!(pending.authorize_url.contains("client_id=app-key"));
        assert!(pending.authorize_url.contains("code_challenge_method=S256"));
        assert_eq!(auth.state(), AuthState::Authenticating);
    }

    #[test]
    fn test_pending_verifier_survives_restart() {
        let settings = Arc::new(InMemorySettings::new());
        let auth = authenticator(Arc::clone(&settings));
        let pending = auth.start_external_auth().unwrap();

        let verifier = settings.get_string(DROPBOX_PENDING_VERIFIER).unwrap();
        let challenge = Pkce::from_verifier(verifier).challenge;
        assert!(pending.authorize_url.contains(&challenge));
    }

    #[test]
    fn test_token_persisted_and_restored() {
        let settings = Arc::new(InMemorySettings::new());
        let auth = authenticator(Arc::clone(&settings));
        auth.accept_token("tok").unwrap();
        assert_eq!(settings.dropbox_auth_token().as_deref(), Some("tok"));

        let restored = authenticator(settings);
        assert!(!restored.is_authentication_required());
        assert_eq!(restored.auth_token().as_deref(), Some("tok"));
        assert_eq!(restored.state(), AuthState::Authenticated);
    }

    #[test]
    fn test_rejection_clears_token() {
        let settings = Arc::new(InMemorySettings::new());
        settings.set_dropbox_auth_token(Some("stale")).unwrap();
        let auth = authenticator(Arc::clone(&settings));

        auth.on_credentials_rejected();
        assert_eq!(auth.state(), AuthState::CredentialsRejected);
        assert!(auth.is_authentication_required());
        assert!(settings.dropbox_auth_token().is_none());
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_set_credentials_is_incorrect_use() {
        let auth = authenticator(Arc::new(InMemorySettings::new()));
        auth.set_credentials(ServerCredentials::basic("https://x", "u", "p"));
    }

    #[test]
    #[should_panic(expected = "incorrect use")]
    fn test_complete_without_start_is_incorrect_use() {
        let auth = authenticator(Arc::new(InMemorySettings::new()));
        let _ = auth.complete_external_auth("code");
    }

    #[test]
    fn test_missing_app_key() {
        let config = DropboxConfig {
            app_key: String::new(),
            redirect_uri: None,
        };
        let auth =
            DropboxAuthenticator::new(&config, &NetworkConfig::default(), Arc::new(InMemorySettings::new())).unwrap();
        assert!(matches!(
            auth.start_external_auth(),
            Err(FileSystemError::Authentication(_))
        ));
    }
}
