use std::sync::Arc;

use anyhow::{bail, Result};

use keepsync_lib::database::{ObserverBus, ObserverEvent};
use keepsync_lib::dispatch::Dispatchers;
use keepsync_lib::fs::{FileDescriptor, FsType};
use keepsync_lib::sync::{ConflictResolutionStrategy, SyncService, SyncServiceError, SyncStrategy};
use keepsync_lib::FileSystemError;

use crate::app::App;
use crate::render::terminal;
use crate::OutputFormat;

fn service(app: &App) -> SyncService {
    let bus = Arc::new(ObserverBus::new());
    bus.subscribe(|event| {
        if let ObserverEvent::SyncStatusChanged { path, status } = event {
            log::debug!("{} is now {}", path, status);
        }
    });
    SyncService::new(
        Arc::clone(&app.resolver),
        Dispatchers::default(),
        bus,
        app.config.sync.clone(),
    )
}

/// Local files are read and written in place and have nothing to sync
fn ensure_syncable(file: &FileDescriptor) -> Result<()> {
    if file.fs_authority.fs_type == FsType::RegularFs {
        bail!("{} is a local file and is never synced", file.path);
    }
    Ok(())
}

pub async fn run_status(app: &App, file: &FileDescriptor, format: &OutputFormat, use_color: bool) -> Result<()> {
    ensure_syncable(file)?;
    let status = service(app).status(file).await?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "path": file.path, "status": status }))?
        ),
        OutputFormat::Plain => println!("{}: {}", file.path, terminal::status(status, use_color)),
    }
    Ok(())
}

pub async fn run_sync(
    app: &App,
    file: &FileDescriptor,
    strategy: SyncStrategy,
    on_conflict: Option<ConflictResolutionStrategy>,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    ensure_syncable(file)?;
    let service = service(app);
    let cancel = service.cancellation_token();
    let interrupted = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = service.sync(file, strategy, on_conflict).await;
    interrupted.abort();

    let report = match result {
        Ok(report) => report,
        Err(SyncServiceError::FileSystem(FileSystemError::SyncConflict(info))) => {
            anyhow::bail!(
                "{} changed both locally ({}) and remotely ({}); rerun with --keep-local or --keep-remote",
                info.local.path,
                terminal::timestamp(info.local_modified),
                terminal::timestamp(info.remote_modified)
            );
        }
        Err(e) => return Err(e.into()),
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "path": report.file.path,
                "status": report.status,
                "action": report.action,
            }))?
        ),
        OutputFormat::Plain => println!(
            "{}: {} ({})",
            report.file.path,
            terminal::action(report.action),
            terminal::status(report.status, use_color)
        ),
    }
    Ok(())
}
