//! WebDAV backend: etags as revisions, `If-Match`/`If-None-Match` as upload
//! preconditions

mod client;

use std::sync::Arc;

pub use client::{parse_propfind_response, WebDAVClient, WebDAVError};

use crate::config::NetworkConfig;
use crate::fs::remote::{RemoteFileSystemProvider, RemoteSession};
use crate::fs::{CredentialsAuthenticator, FileSystemAuthenticator, FileSystemError, FsAuthority, Result};
use crate::sync::LocalCache;

pub type WebDAVFileSystemProvider = RemoteFileSystemProvider<WebDAVClient>;

pub fn webdav_provider(
    authority: &FsAuthority,
    network: &NetworkConfig,
    cache: Arc<LocalCache>,
) -> Result<WebDAVFileSystemProvider> {
    let credentials = authority
        .credentials
        .clone()
        .ok_or_else(|| FileSystemError::Authentication("WebDAV requires a server and credentials".to_string()))?;
    let server_url = credentials.server_url().to_string();

    let authenticator: Arc<dyn FileSystemAuthenticator> = Arc::new(CredentialsAuthenticator::new(Some(credentials)));
    let client = WebDAVClient::new(&server_url, Arc::clone(&authenticator), network)?;
    let session = RemoteSession::new(authority.clone(), Arc::new(client), authenticator);
    Ok(RemoteFileSystemProvider::new(session, cache))
}
