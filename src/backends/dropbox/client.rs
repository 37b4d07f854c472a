use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::NetworkConfig;
use crate::fs::remote::{RemoteClient, RemoteMetadata, UploadOutcome, WriteMode};
use crate::fs::{normalize_path, FileSystemAuthenticator, FileSystemError, Result};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";

#[derive(Error, Debug)]
pub enum DropboxError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Not signed in to Dropbox")]
    NotSignedIn,
    #[error("Access token rejected")]
    TokenRejected,
    #[error("Dropbox API error {status}: {summary}")]
    Api { status: u16, summary: String },
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl From<DropboxError> for FileSystemError {
    fn from(err: DropboxError) -> Self {
        match err {
            DropboxError::Http(e) => FileSystemError::NetworkIo(e.to_string()),
            DropboxError::NotSignedIn | DropboxError::TokenRejected => FileSystemError::Authentication(err.to_string()),
            DropboxError::Api { status, ref summary } => {
                if summary.contains("not_found") {
                    FileSystemError::NotFound(summary.clone())
                } else if status == 429 || status >= 500 {
                    FileSystemError::NetworkIo(err.to_string())
                } else if summary.contains("insufficient_space") || summary.contains("no_write_permission") {
                    FileSystemError::Permission(err.to_string())
                } else {
                    FileSystemError::InvalidData(err.to_string())
                }
            }
            DropboxError::Decode(msg) => FileSystemError::InvalidData(msg),
        }
    }
}

/// Metadata entry as returned by the files endpoints
#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum DropboxEntry {
    File {
        id: String,
        path_display: String,
        rev: String,
        server_modified: DateTime<Utc>,
        size: u64,
    },
    Folder {
        id: String,
        path_display: String,
    },
    Deleted {
        path_display: String,
    },
}

impl DropboxEntry {
    /// `None` for deletion markers
    pub fn to_metadata(&self) -> Option<RemoteMetadata> {
        match self {
            DropboxEntry::File {
                id,
                path_display,
                rev,
                server_modified,
                size,
            } => Some(RemoteMetadata {
                path: normalize_path(path_display),
                uid: id.clone(),
                is_directory: false,
                revision: Some(rev.clone()),
                modified: Some(*server_modified),
                size: Some(*size),
            }),
            DropboxEntry::Folder { id, path_display } => Some(RemoteMetadata {
                path: normalize_path(path_display),
                uid: id.clone(),
                is_directory: true,
                revision: None,
                modified: None,
                size: None,
            }),
            DropboxEntry::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<DropboxEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct CreateFolderResponse {
    metadata: DropboxEntry,
}

/// Dropbox addresses its root as the empty string
fn api_path(path: &str) -> String {
    let path = normalize_path(path);
    if path == "/" {
        String::new()
    } else {
        path
    }
}

/// `mode` argument of an upload
fn upload_mode(mode: &WriteMode) -> Value {
    match mode {
        WriteMode::Create => json!("add"),
        WriteMode::Update(rev) => json!({ ".tag": "update", "update": rev }),
        WriteMode::Overwrite => json!("overwrite"),
    }
}

/// Dropbox HTTP API v2 client
pub struct DropboxClient {
    client: Client,
    authenticator: Arc<dyn FileSystemAuthenticator>,
}

impl DropboxClient {
    pub fn new(
        authenticator: Arc<dyn FileSystemAuthenticator>,
        network: &NetworkConfig,
    ) -> std::result::Result<Self, DropboxError> {
        let client = Client::builder()
            .timeout(network.timeout())
            .connect_timeout(network.connect_timeout())
            .build()?;
        Ok(Self { client, authenticator })
    }

    fn token(&self) -> std::result::Result<String, DropboxError> {
        self.authenticator.auth_token().ok_or(DropboxError::NotSignedIn)
    }

    fn check(response: Response) -> std::result::Result<Response, DropboxError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(DropboxError::TokenRejected);
        }
        let body = response.text().unwrap_or_default();
        let summary = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error_summary").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(DropboxError::Api {
            status: status.as_u16(),
            summary,
        })
    }

    fn rpc<T: serde::de::DeserializeOwned>(&self, endpoint: &str, arg: Value) -> std::result::Result<T, DropboxError> {
        log::debug!("Dropbox {}", endpoint);
        let response = self
            .client
            .post(format!("{}/{}", API_URL, endpoint))
            .bearer_auth(self.token()?)
            .json(&arg)
            .send()?;
        let response = Self::check(response)?;
        response.json().map_err(|e| DropboxError::Decode(e.to_string()))
    }

    fn result_header(response: &Response) -> std::result::Result<DropboxEntry, DropboxError> {
        let header = response
            .headers()
            .get("Dropbox-API-Result")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DropboxError::Decode("missing Dropbox-API-Result header".to_string()))?;
        serde_json::from_str(header).map_err(|e| DropboxError::Decode(e.to_string()))
    }
}

fn is_not_found(err: &DropboxError) -> bool {
    matches!(err, DropboxError::Api { summary, .. } if summary.contains("not_found"))
}

fn is_conflict(err: &DropboxError) -> bool {
    matches!(err, DropboxError::Api { status: 409, summary } if summary.contains("conflict"))
}

fn to_metadata(entry: &DropboxEntry) -> Result<RemoteMetadata> {
    entry
        .to_metadata()
        .ok_or_else(|| FileSystemError::InvalidData("unexpected deletion marker".to_string()))
}

impl RemoteClient for DropboxClient {
    fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        let path = api_path(path);
        if path.is_empty() {
            return Ok(Some(RemoteMetadata {
                path: "/".to_string(),
                uid: "/".to_string(),
                is_directory: true,
                revision: None,
                modified: None,
                size: None,
            }));
        }

        match self.rpc::<DropboxEntry>("files/get_metadata", json!({ "path": path })) {
            Ok(entry) => Ok(entry.to_metadata()),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteMetadata>> {
        let mut page: ListFolderResponse = self.rpc("files/list_folder", json!({ "path": api_path(path) }))?;
        let mut entries: Vec<RemoteMetadata> = page.entries.iter().filter_map(DropboxEntry::to_metadata).collect();
        while page.has_more {
            page = self.rpc("files/list_folder/continue", json!({ "cursor": page.cursor }))?;
            entries.extend(page.entries.iter().filter_map(DropboxEntry::to_metadata));
        }
        Ok(entries)
    }

    fn download(&self, path: &str) -> Result<(Vec<u8>, RemoteMetadata)> {
        let arg = json!({ "path": api_path(path) }).to_string();
        log::debug!("Dropbox files/download {}", path);
        let response = self
            .client
            .post(format!("{}/files/download", CONTENT_URL))
            .bearer_auth(self.token()?)
            .header("Dropbox-API-Arg", arg)
            .send()
            .map_err(DropboxError::from)?;
        let response = Self::check(response)?;
        let entry = Self::result_header(&response)?;
        let data = response.bytes().map_err(DropboxError::from)?.to_vec();
        Ok((data, to_metadata(&entry)?))
    }

    fn upload(&self, path: &str, content: &[u8], mode: &WriteMode) -> Result<UploadOutcome> {
        let arg = json!({
            "path": api_path(path),
            "mode": upload_mode(mode),
            "autorename": false,
            "mute": true,
            "strict_conflict": true,
        })
        .to_string();

        log::debug!("Dropbox files/upload {} ({} bytes)", path, content.len());
        let response = self
            .client
            .post(format!("{}/files/upload", CONTENT_URL))
            .bearer_auth(self.token()?)
            .header("Dropbox-API-Arg", arg)
            .header("Content-Type", "application/octet-stream")
            .body(content.to_vec())
            .send()
            .map_err(DropboxError::from)?;

        match Self::check(response) {
            Ok(response) => {
                let entry: DropboxEntry = response.json().map_err(|e| DropboxError::Decode(e.to_string()))?;
                Ok(UploadOutcome::Uploaded(to_metadata(&entry)?))
            }
            Err(e) if is_conflict(&e) => {
                log::info!("Dropbox rejected upload of {}: {}", path, e);
                Ok(UploadOutcome::RevisionMismatch)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_directory(&self, path: &str) -> Result<RemoteMetadata> {
        match self.rpc::<CreateFolderResponse>(
            "files/create_folder_v2",
            json!({ "path": api_path(path), "autorename": false }),
        ) {
            Ok(created) => to_metadata(&created.metadata),
            Err(e) if is_conflict(&e) => Err(FileSystemError::AlreadyExists(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.rpc::<Value>("files/delete_v2", json!({ "path": api_path(path) }))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_FOLDER: &str = r#"{
        "entries": [
            {
                ".tag": "folder",
                "name": "Backups",
                "path_lower": "/keys/backups",
                "path_display": "/Keys/Backups",
                "id": "id:a4ayc_80_OEAAAAAAAAAXz"
            },
            {
                ".tag": "file",
                "name": "Vault.kdbx",
                "path_lower": "/keys/vault.kdbx",
                "path_display": "/Keys/Vault.kdbx",
                "id": "id:a4ayc_80_OEAAAAAAAAAXw",
                "client_modified": "2025-05-12T15:50:38Z",
                "server_modified": "2025-05-12T15:50:39Z",
                "rev": "a1c10ce0dd78",
                "size": 7212,
                "content_hash": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            },
            {
                ".tag": "deleted",
                "name": "old.kdbx",
                "path_lower": "/keys/old.kdbx",
                "path_display": "/Keys/old.kdbx"
            }
        ],
        "cursor": "ZtkX9_EHj3x7PMkVuFIhwKYXEpwpLwyxp9vMKomUhllil9q7eWiAu",
        "has_more": false
    }"#;

    #[test]
    fn test_list_folder_mapping() {
        let page: ListFolderResponse = serde_json::from_str(LIST_FOLDER).unwrap();
        assert!(!page.has_more);
        let entries: Vec<RemoteMetadata> = page.entries.iter().filter_map(DropboxEntry::to_metadata).collect();
        assert_eq!(entries.len(), 2);

        assert!(entries[0].is_directory);
        assert_eq!(entries[0].path, "/Keys/Backups");

        let vault = &entries[1];
        assert_eq!(vault.uid, "id:a4ayc_80_OEAAAAAAAAAXw");
        assert_eq!(vault.revision.as_deref(), Some("a1c10ce0dd78"));
        assert_eq!(vault.size, Some(7212));
        assert_eq!(
            vault.modified.map(|m| m.to_rfc3339()),
            Some("2025-05-12T15:50:39+00:00".to_string())
        );
    }

    #[test]
    fn test_upload_modes() {
        assert_eq!(upload_mode(&WriteMode::Create), json!("add"));
        assert_eq!(upload_mode(&WriteMode::Overwrite), json!("overwrite"));
        assert_eq!(
            upload_mode(&WriteMode::Update("a1c10ce0dd78".to_string())),
            json!({ ".tag": "update", "update": "a1c10ce0dd78" })
        );
    }

    #[test]
    fn test_root_path() {
        assert_eq!(api_path("/"), "");
        assert_eq!(api_path("Keys//Vault.kdbx"), "/Keys/Vault.kdbx");
    }

    #[test]
    fn test_error_mapping() {
        let conflict = DropboxError::Api {
            status: 409,
            summary: "path/conflict/file/..".to_string(),
        };
        assert!(is_conflict(&conflict));

        let missing = DropboxError::Api {
            status: 409,
            summary: "path/not_found/..".to_string(),
        };
        assert!(is_not_found(&missing));
        assert!(matches!(FileSystemError::from(missing), FileSystemError::NotFound(_)));

        let throttled = DropboxError::Api {
            status: 429,
            summary: "too_many_requests/".to_string(),
        };
        assert!(FileSystemError::from(throttled).is_network());
        assert!(FileSystemError::from(DropboxError::TokenRejected).is_authentication());
    }
}
