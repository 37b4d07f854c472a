use chrono::{DateTime, Local, Utc};

use keepsync_lib::fs::FileDescriptor;
use keepsync_lib::sync::{SyncAction, SyncStatus};

/// ANSI color codes
pub struct Color;

impl Color {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const BLUE: &str = "\x1b[34m";
}

pub fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("{}{}{}", color, text, Color::RESET)
    } else {
        text.to_string()
    }
}

pub fn status(status: SyncStatus, use_color: bool) -> String {
    let (label, color) = match status {
        SyncStatus::NoChanges => ("up to date", Color::GREEN),
        SyncStatus::LocalChanges => ("local changes", Color::YELLOW),
        SyncStatus::RemoteChanges => ("remote changes", Color::YELLOW),
        SyncStatus::Conflict => ("conflict", Color::RED),
        SyncStatus::LocalChangesNoNetwork => ("local changes, offline", Color::YELLOW),
        SyncStatus::NoNetwork => ("offline", Color::DIM),
        SyncStatus::Error => ("error", Color::RED),
    };
    paint(label, color, use_color)
}

pub fn action(action: SyncAction) -> &'static str {
    match action {
        SyncAction::None => "nothing to do",
        SyncAction::Pushed => "pushed local changes",
        SyncAction::Pulled => "pulled remote changes",
        SyncAction::Deferred => "queued for later",
        SyncAction::ResolvedKeepLocal => "conflict resolved, kept local copy",
        SyncAction::ResolvedKeepRemote => "conflict resolved, kept remote copy",
    }
}

pub fn timestamp(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// One line of a directory listing
pub fn entry(file: &FileDescriptor, use_color: bool) -> String {
    if file.is_directory {
        format!("{}/", paint(&file.name, Color::BLUE, use_color))
    } else {
        format!(
            "{:<40} {}",
            file.name,
            paint(&timestamp(file.modified), Color::DIM, use_color)
        )
    }
}
