use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fs::FileDescriptor;

/// Relationship between the cached copy of a file and its remote copy.
///
/// Always derived from the sync record and fresh remote metadata, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    NoChanges,
    LocalChanges,
    RemoteChanges,
    Conflict,
    LocalChangesNoNetwork,
    NoNetwork,
    /// Transport or auth failure other than an unreachable network
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NoChanges => "NO_CHANGES",
            SyncStatus::LocalChanges => "LOCAL_CHANGES",
            SyncStatus::RemoteChanges => "REMOTE_CHANGES",
            SyncStatus::Conflict => "CONFLICT",
            SyncStatus::LocalChangesNoNetwork => "LOCAL_CHANGES_NO_NETWORK",
            SyncStatus::NoNetwork => "NO_NETWORK",
            SyncStatus::Error => "ERROR",
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, SyncStatus::LocalChangesNoNetwork | SyncStatus::NoNetwork)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a reconciliation pass performs network I/O now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    SyncAutomatically,
    /// Record the pending operation and return without network I/O
    Defer,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::SyncAutomatically => "SYNC_AUTOMATICALLY",
            SyncStrategy::Defer => "DEFER",
        }
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SYNC_AUTOMATICALLY" => Ok(SyncStrategy::SyncAutomatically),
            "DEFER" => Ok(SyncStrategy::Defer),
            other => Err(format!("Unknown sync strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolutionStrategy {
    KeepLocal,
    KeepRemote,
}

/// Both candidates of an unresolved conflict
#[derive(Debug, Clone)]
pub struct SyncConflictInfo {
    pub local: FileDescriptor,
    pub remote: FileDescriptor,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_modified: Option<DateTime<Utc>>,
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncAction {
    None,
    Pushed,
    Pulled,
    Deferred,
    ResolvedKeepLocal,
    ResolvedKeepRemote,
}

/// Outcome of one `process` call
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Descriptor reflecting the file after the pass
    pub file: FileDescriptor,
    /// Classification observed at the start of the pass
    pub status: SyncStatus,
    pub action: SyncAction,
}

impl SyncReport {
    pub fn wrote_anything(&self) -> bool {
        !matches!(self.action, SyncAction::None | SyncAction::Deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("defer".parse::<SyncStrategy>().unwrap(), SyncStrategy::Defer);
        assert_eq!(
            SyncStrategy::SyncAutomatically.as_str().parse::<SyncStrategy>().unwrap(),
            SyncStrategy::SyncAutomatically
        );
        assert!("later".parse::<SyncStrategy>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SyncStatus::LocalChangesNoNetwork).unwrap();
        assert_eq!(json, "\"LOCAL_CHANGES_NO_NETWORK\"");
        assert!(SyncStatus::NoNetwork.is_offline());
        assert!(!SyncStatus::Conflict.is_offline());
    }
}
