//! Polls a backend's session watcher and reports out-of-band changes.
//!
//! Purely advisory: changes are announced on the event bus, the local store
//! is never touched.

use crate::events::{ChangeKind, EventBus, SyncEvent};
use booth_cloud::SessionWatcher;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// One difference between two session snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Changed { session_id: String, kind: ChangeKind },
    Deleted { session_id: String },
}

impl From<SessionChange> for SyncEvent {
    fn from(change: SessionChange) -> Self {
        match change {
            SessionChange::Changed { session_id, kind } => {
                SyncEvent::CloudSessionChanged { session_id, kind }
            }
            SessionChange::Deleted { session_id } => SyncEvent::CloudSessionDeleted { session_id },
        }
    }
}

/// Compares two `id -> version` snapshots. Without a previous snapshot every
/// session counts as added. Results are ordered by session id.
pub fn diff_snapshots(
    previous: Option<&HashMap<String, String>>,
    current: &HashMap<String, String>,
) -> Vec<SessionChange> {
    let mut changes = Vec::new();

    for (id, version) in current {
        let kind = match previous.and_then(|p| p.get(id)) {
            None => Some(ChangeKind::Added),
            Some(old) if old != version => Some(ChangeKind::Modified),
            Some(_) => None,
        };
        if let Some(kind) = kind {
            changes.push(SessionChange::Changed {
                session_id: id.clone(),
                kind,
            });
        }
    }

    if let Some(previous) = previous {
        for id in previous.keys().filter(|id| !current.contains_key(*id)) {
            changes.push(SessionChange::Deleted {
                session_id: id.clone(),
            });
        }
    }

    changes.sort_by(|a, b| change_id(a).cmp(change_id(b)));
    changes
}

fn change_id(change: &SessionChange) -> &str {
    match change {
        SessionChange::Changed { session_id, .. } | SessionChange::Deleted { session_id } => {
            session_id
        }
    }
}

/// Poll interval plus up to 10% random jitter
fn next_delay(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() / 10) as u64;
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

/// A running watcher; stops when stopped explicitly or dropped
pub struct RealtimeHandle {
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts polling `watcher` every `interval`.
///
/// A rejected credential ends the watcher after calling `on_unauthorized`;
/// other failures are logged and the next poll tries again.
pub fn spawn_session_watcher<F>(
    watcher: Arc<dyn SessionWatcher>,
    events: Arc<EventBus>,
    interval: Duration,
    on_unauthorized: F,
) -> RealtimeHandle
where
    F: Fn() + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        log::info!("Realtime session watcher started ({:?} interval)", interval);
        let mut previous: Option<HashMap<String, String>> = None;

        loop {
            match watcher.snapshot().await {
                Ok(current) => {
                    for change in diff_snapshots(previous.as_ref(), &current) {
                        log::debug!("Remote session change: {:?}", change);
                        events.emit(change.into());
                    }
                    previous = Some(current);
                }
                Err(e) if e.is_auth() => {
                    log::warn!("Realtime watcher stopped: {}", e);
                    on_unauthorized();
                    break;
                }
                Err(e) => log::debug!("Realtime poll failed: {}", e),
            }

            tokio::time::sleep(next_delay(interval)).await;
        }
    });

    RealtimeHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booth_cloud::{MemoryBackend, RemoteDataService, RemoteSession};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(id, v)| (id.to_string(), v.to_string()))
            .collect()
    }

    fn remote_session(id: &str) -> RemoteSession {
        RemoteSession {
            id: id.to_string(),
            name: id.to_string(),
            design_url: None,
            settings: serde_json::json!({}),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_first_snapshot_reports_added() {
        let changes = diff_snapshots(None, &snapshot(&[("b", "1"), ("a", "1")]));
        assert_eq!(
            changes,
            vec![
                SessionChange::Changed {
                    session_id: "a".to_string(),
                    kind: ChangeKind::Added
                },
                SessionChange::Changed {
                    session_id: "b".to_string(),
                    kind: ChangeKind::Added
                },
            ]
        );
    }

    #[test]
    fn test_diff_modified_and_deleted() {
        let before = snapshot(&[("a", "1"), ("b", "1"), ("c", "1")]);
        let after = snapshot(&[("a", "1"), ("b", "2"), ("d", "1")]);

        let changes = diff_snapshots(Some(&before), &after);
        assert_eq!(changes.len(), 3);
        assert!(changes.contains(&SessionChange::Changed {
            session_id: "b".to_string(),
            kind: ChangeKind::Modified
        }));
        assert!(changes.contains(&SessionChange::Deleted {
            session_id: "c".to_string()
        }));
        assert!(changes.contains(&SessionChange::Changed {
            session_id: "d".to_string(),
            kind: ChangeKind::Added
        }));
    }

    #[test]
    fn test_delay_has_bounded_jitter() {
        let interval = Duration::from_millis(1000);
        for _ in 0..20 {
            let delay = next_delay(interval);
            assert!(delay >= interval && delay <= Duration::from_millis(1100));
        }
    }

    #[tokio::test]
    async fn test_watcher_emits_remote_changes() {
        let backend = MemoryBackend::new().with_realtime();
        let credential = backend.seed_account("booth@example.com", "secret");
        backend.set_credential(Some(&credential));
        backend.seed_session(&credential.user.id, remote_session("s1"));

        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let watcher = backend.session_watcher().unwrap();
        let handle = spawn_session_watcher(watcher, events, Duration::from_millis(10), || {});

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            SyncEvent::CloudSessionChanged {
                session_id: "s1".to_string(),
                kind: ChangeKind::Added
            }
        );

        backend.remove_session(&credential.user.id, "s1");
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            second,
            SyncEvent::CloudSessionDeleted {
                session_id: "s1".to_string()
            }
        );

        handle.stop();
    }

    #[tokio::test]
    async fn test_watcher_stops_on_rejected_credential() {
        let backend = MemoryBackend::new().with_realtime();
        let credential = backend.seed_account("booth@example.com", "secret");
        backend.set_credential(Some(&credential));
        backend.expire_tokens();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = spawn_session_watcher(
            backend.session_watcher().unwrap(),
            Arc::new(EventBus::new()),
            Duration::from_millis(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_finished());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
