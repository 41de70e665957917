//! Typed notifications from the sync engine to whoever renders it.
//!
//! The current [`SyncStatus`] is a `watch` value, so late subscribers still
//! see it. Everything else is a [`SyncEvent`] on a broadcast channel.

use booth_store::UserProfile;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
    /// A drain pass left items in the queue
    Partial,
    /// Items are queued and no pass is running
    Pending,
    Offline,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Partial => "partial",
            SyncStatus::Pending => "pending",
            SyncStatus::Offline => "offline",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Signed in (`Some`) or signed out / expired (`None`)
    IdentityChanged(Option<UserProfile>),
    StatusChanged(SyncStatus),
    PhotoQueued { photo_id: String },
    PhotoSynced { photo_id: String, cloud_url: String },
    /// The photo can never be uploaded as is and left the queue
    PhotoRejected { photo_id: String, reason: String },
    SessionQueued { session_id: String },
    SessionSynced { session_id: String },
    SessionRejected { session_id: String, reason: String },
    /// A session document changed remotely, outside this device
    CloudSessionChanged { session_id: String, kind: ChangeKind },
    CloudSessionDeleted { session_id: String },
    MergeFailed { reason: String },
    /// The credential was rejected; the user has to sign in again
    ReauthRequired,
}

pub struct EventBus {
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { status, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Publishes a status; listeners only hear about actual changes
    pub fn set_status(&self, status: SyncStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            log::debug!("Sync status {} -> {}", previous, status);
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is fine; nobody is looking
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_change_emits_once() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let status = bus.watch_status();

        bus.set_status(SyncStatus::Syncing);
        bus.set_status(SyncStatus::Syncing);
        bus.set_status(SyncStatus::Synced);

        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::StatusChanged(SyncStatus::Syncing)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::StatusChanged(SyncStatus::Synced)
        );
        assert!(events.try_recv().is_err());
        assert_eq!(*status.borrow(), SyncStatus::Synced);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::ReauthRequired);
        assert_eq!(bus.status(), SyncStatus::Idle);
        assert_eq!(SyncStatus::Partial.to_string(), "partial");
    }
}
