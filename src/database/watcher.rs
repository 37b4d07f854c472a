//! In-process publish/subscribe.
//!
//! Subscriber lists are copy-on-write: `notify` iterates a snapshot, so
//! callbacks may subscribe or unsubscribe without deadlocking and a
//! concurrent mutation never disturbs a notification in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::fs::FileDescriptor;
use crate::sync::SyncStatus;

pub type SubscriptionId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Watcher<E> {
    subscribers: RwLock<Arc<Vec<(SubscriptionId, Callback<E>)>>>,
    next_id: AtomicU64,
}

impl<E> Default for Watcher<E> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> Watcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = Vec::with_capacity(subscribers.len() + 1);
        updated.extend(subscribers.iter().cloned());
        updated.push((id, Arc::new(callback) as Callback<E>));
        *subscribers = Arc::new(updated);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if !subscribers.iter().any(|(sid, _)| *sid == id) {
            return false;
        }
        let updated: Vec<_> = subscribers.iter().filter(|(sid, _)| *sid != id).cloned().collect();
        *subscribers = Arc::new(updated);
        true
    }

    pub fn notify(&self, event: &E) {
        let snapshot = Arc::clone(&self.subscribers.read().unwrap_or_else(PoisonError::into_inner));
        for (_, callback) in snapshot.iter() {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<E: Clone + Send + 'static> Watcher<E> {
    /// Receive events on a channel instead of a callback; the subscription
    /// stays until unsubscribed
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event: &E| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseEvent {
    Opened { file: FileDescriptor },
    Committed { file: FileDescriptor },
    Closed { file: FileDescriptor },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEvent {
    GroupInserted(Uuid),
    GroupUpdated(Uuid),
    GroupRemoved(Uuid),
    NoteInserted(Uuid),
    NoteUpdated(Uuid),
    NoteRemoved(Uuid),
}

/// Coarse domain events for screens that redraw whole lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    GroupDataSetChanged,
    NoteDataSetChanged,
    DatabaseStatusChanged { open: bool },
    SyncStatusChanged { path: String, status: SyncStatus },
}

pub type DatabaseWatcher = Watcher<DatabaseEvent>;
pub type ContentWatcher = Watcher<ContentEvent>;
pub type ObserverBus = Watcher<ObserverEvent>;
