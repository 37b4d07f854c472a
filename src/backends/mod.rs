//! Storage backends and the resolver wiring them together

pub mod dropbox;
pub mod fake;
pub mod git;
pub mod regular;
pub mod webdav;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{AppConfig, ConfigError, DropboxConfig, NetworkConfig};
use crate::fs::{FileSystemProvider, FileSystemResolver, FsAuthority, FsType, ResolverConfigError};
use crate::settings::Settings;
use crate::sync::{DirectoryShare, LocalCache};

use fake::FakeRemote;
use git::CopySlot;
use regular::RegularFileSystemProvider;

/// Everything the provider factories need
#[derive(Clone)]
pub struct BackendContext {
    /// Per-authority sync caches
    pub cache_root: PathBuf,
    /// Git working copies
    pub work_root: PathBuf,
    /// Directory the local provider treats as its root
    pub local_root: PathBuf,
    pub settings: Arc<dyn Settings>,
    pub network: NetworkConfig,
    pub dropbox: DropboxConfig,
    /// In-process store behind every fake authority
    pub fake_remote: Arc<FakeRemote>,
    /// Authorities with the same key use one cache and one working copy
    pub caches: Arc<DirectoryShare<LocalCache>>,
    pub working_copies: Arc<DirectoryShare<CopySlot>>,
}

impl BackendContext {
    pub fn from_config(config: &AppConfig, settings: Arc<dyn Settings>) -> Result<Self, ConfigError> {
        Ok(Self {
            cache_root: config.cache_dir()?,
            work_root: config.data_dir()?.join("git"),
            local_root: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            settings,
            network: config.network.clone(),
            dropbox: config.dropbox.clone(),
            fake_remote: Arc::new(FakeRemote::new()),
            caches: Arc::default(),
            working_copies: Arc::default(),
        })
    }

    fn cache(&self, authority: &FsAuthority) -> Arc<LocalCache> {
        self.caches.cache_for(&self.cache_root, authority)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            cache_root: dir.join("cache"),
            work_root: dir.join("git"),
            local_root: dir.to_path_buf(),
            settings: Arc::new(crate::settings::InMemorySettings::new()),
            network: NetworkConfig::default(),
            dropbox: DropboxConfig::default(),
            fake_remote: Arc::new(FakeRemote::new()),
            caches: Arc::default(),
            working_copies: Arc::default(),
        }
    }
}

/// Resolver with a factory for every backend type
pub fn resolver(context: &BackendContext) -> Result<FileSystemResolver, ResolverConfigError> {
    let local = context.local_root.clone();
    let (dav_ctx, dropbox_ctx, git_ctx, fake_ctx) = (context.clone(), context.clone(), context.clone(), context.clone());

    FileSystemResolver::builder()
        .register(FsType::RegularFs, move |_authority| {
            Ok(Arc::new(RegularFileSystemProvider::new(local.clone())) as Arc<dyn FileSystemProvider>)
        })
        .register(FsType::Webdav, move |authority| {
            let provider = webdav::webdav_provider(authority, &dav_ctx.network, dav_ctx.cache(authority))?;
            Ok(Arc::new(provider) as Arc<dyn FileSystemProvider>)
        })
        .register(FsType::Dropbox, move |authority| {
            let provider = dropbox::dropbox_provider(
                authority,
                &dropbox_ctx.dropbox,
                &dropbox_ctx.network,
                Arc::clone(&dropbox_ctx.settings),
                dropbox_ctx.cache(authority),
            )?;
            Ok(Arc::new(provider) as Arc<dyn FileSystemProvider>)
        })
        .register(FsType::Git, move |authority| {
            let provider = git::git_provider(
                authority,
                &git_ctx.work_root,
                &git_ctx.working_copies,
                git_ctx.cache(authority),
            )?;
            Ok(Arc::new(provider) as Arc<dyn FileSystemProvider>)
        })
        .register(FsType::Fake, move |authority| {
            let provider = fake::fake_provider(
                authority.clone(),
                Arc::clone(&fake_ctx.fake_remote),
                fake_ctx.cache(authority),
            );
            Ok(Arc::new(provider) as Arc<dyn FileSystemProvider>)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ServerCredentials;
    use crate::sync::FileSystemSyncProcessor;
    use tempfile::TempDir;

    #[test]
    fn test_every_backend_resolves() {
        let dir = TempDir::new().unwrap();
        let context = BackendContext::for_tests(dir.path());
        let resolver = resolver(&context).unwrap();

        let local = resolver.resolve_provider(&FsAuthority::local()).unwrap();
        assert_eq!(local.fs_authority().fs_type, FsType::RegularFs);

        let fake = resolver.resolve_provider(&FsAuthority::new(FsType::Fake, None)).unwrap();
        assert_eq!(fake.fs_authority().fs_type, FsType::Fake);

        let webdav = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com/remote.php/webdav", "u", "p")),
        );
        assert_eq!(resolver.resolve_provider(&webdav).unwrap().fs_authority(), &webdav);

        let dropbox = FsAuthority::new(FsType::Dropbox, None);
        let provider = resolver.resolve_provider(&dropbox).unwrap();
        assert!(provider.authenticator().is_authentication_required());
        assert_eq!(resolver.cached_count(), 4);
    }

    #[test]
    fn test_password_change_keeps_one_cache() {
        let dir = TempDir::new().unwrap();
        let context = BackendContext::for_tests(dir.path());
        let resolver = resolver(&context).unwrap();
        let old = FsAuthority::new(
            FsType::Fake,
            Some(ServerCredentials::basic("https://fake.example.com", "alice", "old")),
        );
        let new = FsAuthority::new(
            FsType::Fake,
            Some(ServerCredentials::basic("https://fake.example.com", "alice", "new")),
        );
        assert_eq!(old.key(), new.key());

        let first = resolver.resolve_provider(&old).unwrap();
        let second = resolver.resolve_provider(&new).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let options = crate::fs::FsOptions::postponed();
        let root = first.root_file().unwrap();
        let file = first.create_file(&root, "vault.kdbx", options).unwrap();
        first.write_file(&file, b"edit", options).unwrap();

        let moved = crate::fs::FileDescriptor::file(new.clone(), file.path.clone(), file.uid.clone());
        assert_eq!(second.read_file(&moved, options).unwrap(), b"edit");
        let pending = second.sync_processor().get_locally_modified_files().unwrap();
        assert_eq!(pending.len(), 1);
        let queue = context.caches.cache_for(&context.cache_root, &new).queue().unwrap();
        assert!(queue.contains(&file.path));
    }

    #[test]
    fn test_webdav_without_credentials_fails() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&BackendContext::for_tests(dir.path())).unwrap();
        let result = resolver.resolve_provider(&FsAuthority::new(FsType::Webdav, None));
        assert!(matches!(result, Err(ref e) if e.is_authentication()));
    }
}
