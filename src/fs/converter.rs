//! Persistence form of [`FsAuthority`]

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::{FileSystemError, Result};
use super::model::{BasicCredentials, FsAuthority, FsType, GitAuth, GitCredentials, ServerCredentials};
use crate::encryption::DataCipher;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAuthority {
    fs_type: FsType,
    /// Ciphertext of [`StoredCredentials`]
    credentials: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredentials {
    server_url: String,
    username: String,
    password: String,
    fs_type: FsType,
    /// Absent in values written before the kind was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<CredentialKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_auth: Option<StoredGitAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum CredentialKind {
    Basic,
    Git,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum StoredGitAuth {
    #[serde(rename_all = "camelCase")]
    Password { username: String, password: String },
    #[serde(rename_all = "camelCase")]
    SshKey { key_path: String, passphrase: Option<String> },
}

/// Converts authorities to and from the string stored in the used-file registry.
/// Credentials are encrypted with the injected cipher.
#[derive(Clone)]
pub struct FsAuthorityConverter {
    cipher: Arc<dyn DataCipher>,
}

impl FsAuthorityConverter {
    pub fn new(cipher: Arc<dyn DataCipher>) -> Self {
        Self { cipher }
    }

    pub fn to_database_value(&self, authority: &FsAuthority) -> Result<String> {
        let credentials = match &authority.credentials {
            Some(credentials) => {
                let stored = to_stored(authority.fs_type, credentials);
                let json = serde_json::to_string(&stored)?;
                let encrypted = self
                    .cipher
                    .encode(&json)
                    .map_err(|e| FileSystemError::Cipher(e.to_string()))?;
                Some(encrypted)
            }
            None => None,
        };

        Ok(serde_json::to_string(&StoredAuthority {
            fs_type: authority.fs_type,
            credentials,
        })?)
    }

    pub fn from_database_value(&self, value: &str) -> Result<FsAuthority> {
        let stored: StoredAuthority = serde_json::from_str(value)?;
        let credentials = match stored.credentials {
            Some(encrypted) => {
                let json = self
                    .cipher
                    .decode(&encrypted)
                    .map_err(|e| FileSystemError::Cipher(e.to_string()))?;
                let credentials: StoredCredentials = serde_json::from_str(&json)?;
                if credentials.fs_type != stored.fs_type {
                    return Err(FileSystemError::InvalidData(format!(
                        "credentials for {} stored under {}",
                        credentials.fs_type, stored.fs_type
                    )));
                }
                Some(from_stored(credentials))
            }
            None => None,
        };

        Ok(FsAuthority::new(stored.fs_type, credentials))
    }
}

fn to_stored(fs_type: FsType, credentials: &ServerCredentials) -> StoredCredentials {
    match credentials {
        ServerCredentials::Basic(basic) => StoredCredentials {
            server_url: basic.server_url.clone(),
            username: basic.username.clone(),
            password: basic.password.clone(),
            fs_type,
            kind: Some(CredentialKind::Basic),
            git_auth: None,
        },
        ServerCredentials::Git(git) => {
            let (username, password) = match &git.auth {
                Some(GitAuth::Password { username, password }) => (username.clone(), password.clone()),
                _ => (String::new(), String::new()),
            };
            let git_auth = git.auth.as_ref().map(|auth| match auth {
                GitAuth::Password { username, password } => StoredGitAuth::Password {
                    username: username.clone(),
                    password: password.clone(),
                },
                GitAuth::SshKey { key_path, passphrase } => StoredGitAuth::SshKey {
                    key_path: key_path.clone(),
                    passphrase: passphrase.clone(),
                },
            });
            StoredCredentials {
                server_url: git.url.clone(),
                username,
                password,
                fs_type,
                kind: Some(CredentialKind::Git),
                git_auth,
            }
        }
    }
}

fn from_stored(stored: StoredCredentials) -> ServerCredentials {
    let kind = stored.kind.unwrap_or(match stored.fs_type {
        FsType::Git => CredentialKind::Git,
        _ => CredentialKind::Basic,
    });
    if kind == CredentialKind::Git {
        let auth = stored.git_auth.map(|auth| match auth {
            StoredGitAuth::Password { username, password } => GitAuth::Password { username, password },
            StoredGitAuth::SshKey { key_path, passphrase } => GitAuth::SshKey { key_path, passphrase },
        });
        return ServerCredentials::Git(GitCredentials {
            url: stored.server_url,
            auth,
        });
    }

    ServerCredentials::Basic(BasicCredentials {
        server_url: stored.server_url,
        username: stored.username,
        password: stored.password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::crypto::generate_key;
    use crate::encryption::{ChaChaDataCipher, PlainDataCipher};

    fn samples() -> Vec<FsAuthority> {
        vec![
            FsAuthority::local(),
            FsAuthority::new(FsType::Dropbox, None),
            FsAuthority::new(FsType::Fake, Some(ServerCredentials::basic("fake://", "u", "p"))),
            FsAuthority::new(
                FsType::Webdav,
                Some(ServerCredentials::basic("https://dav.example.com/files", "alice", "s3cret")),
            ),
            FsAuthority::new(
                FsType::Git,
                Some(ServerCredentials::Git(GitCredentials {
                    url: "https://git.example.com/vault.git".to_string(),
                    auth: Some(GitAuth::Password {
                        username: "alice".to_string(),
                        password: "token".to_string(),
                    }),
                })),
            ),
            FsAuthority::new(
                FsType::Git,
                Some(ServerCredentials::Git(GitCredentials {
                    url: "git@example.com:vault.git".to_string(),
                    auth: Some(GitAuth::SshKey {
                        key_path: "/home/alice/.ssh/id_ed25519".to_string(),
                        passphrase: None,
                    }),
                })),
            ),
            FsAuthority::new(
                FsType::Git,
                Some(ServerCredentials::Git(GitCredentials {
                    url: "/srv/vault.git".to_string(),
                    auth: None,
                })),
            ),
            FsAuthority::new(
                FsType::Git,
                Some(ServerCredentials::basic("https://git.example.com/vault.git", "alice", "token")),
            ),
            FsAuthority::new(
                FsType::Webdav,
                Some(ServerCredentials::Git(GitCredentials {
                    url: "https://dav.example.com/files".to_string(),
                    auth: Some(GitAuth::Password {
                        username: "alice".to_string(),
                        password: "s3cret".to_string(),
                    }),
                })),
            ),
        ]
    }

    #[test]
    fn test_round_trip() {
        let converters = [
            FsAuthorityConverter::new(Arc::new(PlainDataCipher)),
            FsAuthorityConverter::new(Arc::new(ChaChaDataCipher::new(generate_key()))),
        ];
        for converter in &converters {
            for authority in samples() {
                let value = converter.to_database_value(&authority).unwrap();
                assert_eq!(converter.from_database_value(&value).unwrap(), authority);
            }
        }
    }

    #[test]
    fn test_stored_shape() {
        let converter = FsAuthorityConverter::new(Arc::new(ChaChaDataCipher::new(generate_key())));
        let value = converter.to_database_value(&FsAuthority::local()).unwrap();
        assert_eq!(value, r#"{"fsType":"REGULAR_FS","credentials":null}"#);

        let authority = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com", "alice", "s3cret")),
        );
        let value = converter.to_database_value(&authority).unwrap();
        assert!(value.contains("\"fsType\":\"WEBDAV\""));
        assert!(!value.contains("s3cret"));
        assert!(!value.contains("alice"));
    }

    #[test]
    fn test_values_without_kind_follow_fs_type() {
        let converter = FsAuthorityConverter::new(Arc::new(PlainDataCipher));
        let legacy = r#"{"serverUrl":"/srv/vault.git","username":"","password":"","fsType":"GIT"}"#;
        let value = serde_json::to_string(&StoredAuthority {
            fs_type: FsType::Git,
            credentials: Some(PlainDataCipher.encode(legacy).unwrap()),
        })
        .unwrap();

        let authority = converter.from_database_value(&value).unwrap();
        assert_eq!(
            authority.credentials,
            Some(ServerCredentials::Git(GitCredentials {
                url: "/srv/vault.git".to_string(),
                auth: None,
            }))
        );
    }

    #[test]
    fn test_wrong_cipher_fails() {
        let writer = FsAuthorityConverter::new(Arc::new(ChaChaDataCipher::new(generate_key())));
        let reader = FsAuthorityConverter::new(Arc::new(ChaChaDataCipher::new(generate_key())));
        let authority = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com", "alice", "s3cret")),
        );
        let value = writer.to_database_value(&authority).unwrap();
        assert!(matches!(
            reader.from_database_value(&value),
            Err(FileSystemError::Cipher(_))
        ));
    }
}
