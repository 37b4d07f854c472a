use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use super::errors::Result;
use super::model::{FsAuthority, FsType};
use super::provider::FileSystemProvider;

/// Builds the provider for an authority. Factories must not perform I/O.
pub type ProviderFactory = Arc<dyn Fn(&FsAuthority) -> Result<Arc<dyn FileSystemProvider>> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverConfigError {
    #[error("No provider factory registered for {0}")]
    MissingFactory(FsType),
}

#[derive(Default)]
pub struct FileSystemResolverBuilder {
    factories: HashMap<FsType, ProviderFactory>,
}

impl FileSystemResolverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, fs_type: FsType, factory: F) -> Self
    where
        F: Fn(&FsAuthority) -> Result<Arc<dyn FileSystemProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(fs_type, Arc::new(factory));
        self
    }

    /// Fails when any backend type lacks a factory
    pub fn build(self) -> std::result::Result<FileSystemResolver, ResolverConfigError> {
        for fs_type in FsType::ALL {
            if !self.factories.contains_key(&fs_type) {
                return Err(ResolverConfigError::MissingFactory(fs_type));
            }
        }
        Ok(FileSystemResolver {
            factories: self.factories,
            providers: Mutex::new(HashMap::new()),
        })
    }
}

/// Maps an authority to its provider, creating one provider per distinct
/// authority and reusing it afterwards.
pub struct FileSystemResolver {
    factories: HashMap<FsType, ProviderFactory>,
    providers: Mutex<HashMap<FsAuthority, Arc<dyn FileSystemProvider>>>,
}

impl FileSystemResolver {
    pub fn builder() -> FileSystemResolverBuilder {
        FileSystemResolverBuilder::new()
    }

    pub fn resolve_provider(&self, authority: &FsAuthority) -> Result<Arc<dyn FileSystemProvider>> {
        let mut providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = providers.get(authority) {
            return Ok(Arc::clone(provider));
        }

        // `build` guarantees a factory for every type
        let factory = match self.factories.get(&authority.fs_type) {
            Some(factory) => factory,
            None => super::errors::incorrect_use(format!("no factory for {}", authority.fs_type)),
        };

        let provider = factory(authority)?;
        log::debug!("Created {} provider ({})", authority.fs_type, authority.key());
        providers.insert(authority.clone(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Drop the cached provider, e.g. after its credentials were rejected
    pub fn forget(&self, authority: &FsAuthority) -> bool {
        let mut providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        providers.remove(authority).is_some()
    }

    pub fn cached_count(&self) -> usize {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fake::{fake_provider, FakeRemote};
    use crate::fs::ServerCredentials;
    use crate::sync::LocalCache;
    use tempfile::TempDir;

    fn builder_with_all(dir: &TempDir) -> FileSystemResolverBuilder {
        let mut builder = FileSystemResolver::builder();
        for fs_type in FsType::ALL {
            let cache_root = dir.path().to_path_buf();
            builder = builder.register(fs_type, move |authority| {
                let remote = Arc::new(FakeRemote::new());
                let mut authority = authority.clone();
                authority.fs_type = FsType::Fake;
                let cache = Arc::new(LocalCache::new(cache_root.join(authority.key())));
                let provider: Arc<dyn FileSystemProvider> = Arc::new(fake_provider(authority, remote, cache));
                Ok(provider)
            });
        }
        builder
    }

    #[test]
    fn test_resolve_returns_cached_provider() {
        let dir = TempDir::new().unwrap();
        let resolver = builder_with_all(&dir).build().unwrap();

        let a = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com", "alice", "pw")),
        );
        let b = a.clone();
        let first = resolver.resolve_provider(&a).unwrap();
        let second = resolver.resolve_provider(&b).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = FsAuthority::new(
            FsType::Webdav,
            Some(ServerCredentials::basic("https://dav.example.com", "bob", "pw")),
        );
        let third = resolver.resolve_provider(&other).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(resolver.cached_count(), 2);

        assert!(resolver.forget(&a));
        let fourth = resolver.resolve_provider(&a).unwrap();
        assert!(!Arc::ptr_eq(&first, &fourth));
    }

    #[test]
    fn test_build_fails_on_missing_factory() {
        let dir = TempDir::new().unwrap();
        let mut builder = builder_with_all(&dir);
        builder.factories.remove(&FsType::Git);
        assert_eq!(
            builder.build().err(),
            Some(ResolverConfigError::MissingFactory(FsType::Git))
        );
    }
}
