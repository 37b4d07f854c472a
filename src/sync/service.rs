//! Async front of the sync processors.
//!
//! Passes run on the I/O context. Network failures are retried with
//! exponential backoff; authentication, permission and conflict failures are
//! returned at once since retrying can not fix them.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::config::{ConflictResolutionStrategy, SyncAction, SyncReport, SyncStatus, SyncStrategy};
use crate::config::SyncConfig;
use crate::database::{ObserverBus, ObserverEvent};
use crate::dispatch::{DispatchError, Dispatchers};
use crate::fs::{FileDescriptor, FileSystemError, FileSystemResolver, FsAuthority};

#[derive(Debug, Error)]
pub enum SyncServiceError {
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncServiceError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::FileSystem(e) if e.is_network())
    }
}

pub struct SyncService {
    resolver: Arc<FileSystemResolver>,
    dispatchers: Dispatchers,
    observer_bus: Arc<ObserverBus>,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl SyncService {
    pub fn new(
        resolver: Arc<FileSystemResolver>,
        dispatchers: Dispatchers,
        observer_bus: Arc<ObserverBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            resolver,
            dispatchers,
            observer_bus,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token shared by every pass started from this service
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop running passes at their next attempt or backoff
    pub fn cancel(&self) {
        log::info!("Sync: cancelling");
        self.cancel.cancel();
    }

    fn publish(&self, file: &FileDescriptor, status: SyncStatus) {
        self.observer_bus.notify(&ObserverEvent::SyncStatusChanged {
            path: file.path.clone(),
            status,
        });
    }

    /// Classify `file` and announce the result
    pub async fn status(&self, file: &FileDescriptor) -> Result<SyncStatus, SyncServiceError> {
        let resolver = Arc::clone(&self.resolver);
        let target = file.clone();
        let status = self
            .dispatchers
            .io(move || {
                let provider = resolver.resolve_provider(&target.fs_authority)?;
                provider.sync_processor().get_sync_status(&target)
            })
            .await??;
        self.publish(file, status);
        Ok(status)
    }

    async fn attempt(
        &self,
        file: &FileDescriptor,
        strategy: SyncStrategy,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport, SyncServiceError> {
        let resolver = Arc::clone(&self.resolver);
        let target = file.clone();
        let report = self
            .dispatchers
            .io(move || {
                let provider = resolver.resolve_provider(&target.fs_authority)?;
                provider.sync_processor().process(&target, strategy, on_conflict)
            })
            .await??;
        Ok(report)
    }

    /// Run a sync pass for `file`, retrying while the network is unreachable
    pub async fn sync(
        &self,
        file: &FileDescriptor,
        strategy: SyncStrategy,
        on_conflict: Option<ConflictResolutionStrategy>,
    ) -> Result<SyncReport, SyncServiceError> {
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncServiceError::Cancelled);
            }

            match self.attempt(file, strategy, on_conflict).await {
                Ok(report) => {
                    let status = if report.action == SyncAction::Deferred {
                        report.status
                    } else {
                        SyncStatus::NoChanges
                    };
                    self.publish(&report.file, status);
                    return Ok(report);
                }
                Err(e) if e.is_network() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    log::warn!(
                        "Sync: {} unreachable, retry {}/{} in {:?}: {}",
                        file.path,
                        attempt,
                        self.config.max_retries,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(SyncServiceError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if matches!(&e, SyncServiceError::FileSystem(fs) if fs.is_authentication()) {
                        // The next resolve builds a provider around fresh credentials
                        self.resolver.forget(&file.fs_authority);
                        log::warn!("Sync: credentials for {} rejected", file.path);
                    }
                    self.publish_failure(file, &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn publish_failure(&self, file: &FileDescriptor, error: &SyncServiceError) {
        let status = match error {
            SyncServiceError::FileSystem(FileSystemError::SyncConflict(_)) => SyncStatus::Conflict,
            // Offline classification needs no network
            SyncServiceError::FileSystem(FileSystemError::NetworkIo(_)) => match self.status(file).await {
                Ok(_) => return,
                Err(_) => SyncStatus::NoNetwork,
            },
            _ => SyncStatus::Error,
        };
        self.publish(file, status);
    }

    /// Push every cached file of `authority` that has unsynced writes.
    /// Stops at the first failure that is not a network failure.
    pub async fn sync_pending(&self, authority: &FsAuthority) -> Result<Vec<SyncReport>, SyncServiceError> {
        let resolver = Arc::clone(&self.resolver);
        let owner = authority.clone();
        let pending = self
            .dispatchers
            .io(move || {
                let provider = resolver.resolve_provider(&owner)?;
                provider.sync_processor().get_locally_modified_files()
            })
            .await??;

        log::info!("Sync: {} pending file(s) for {}", pending.len(), authority.fs_type);
        let mut reports = Vec::with_capacity(pending.len());
        for file in pending {
            match self.sync(&file, SyncStrategy::SyncAutomatically, None).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_network() => log::warn!("Sync: {} left pending: {}", file.path, e),
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }
}
