//! Dropbox backend. The OAuth token lives in [`Settings`] so a sign-in
//! survives restarts.

mod auth;
mod client;

use std::sync::Arc;

pub use auth::{DropboxAuthenticator, Pkce};
pub use client::{DropboxClient, DropboxEntry, DropboxError};

use crate::config::{DropboxConfig, NetworkConfig};
use crate::fs::remote::{RemoteFileSystemProvider, RemoteSession};
use crate::fs::{FileSystemAuthenticator, FileSystemError, FsAuthority, Result};
use crate::settings::Settings;
use crate::sync::LocalCache;

pub type DropboxFileSystemProvider = RemoteFileSystemProvider<DropboxClient>;

pub fn dropbox_provider(
    authority: &FsAuthority,
    config: &DropboxConfig,
    network: &NetworkConfig,
    settings: Arc<dyn Settings>,
    cache: Arc<LocalCache>,
) -> Result<DropboxFileSystemProvider> {
    let authenticator = DropboxAuthenticator::new(config, network, settings)
        .map_err(|e| FileSystemError::NetworkIo(e.to_string()))?;
    let authenticator: Arc<dyn FileSystemAuthenticator> = Arc::new(authenticator);
    let client = DropboxClient::new(Arc::clone(&authenticator), network)?;
    let session = RemoteSession::new(authority.clone(), Arc::new(client), authenticator);
    Ok(RemoteFileSystemProvider::new(session, cache))
}
