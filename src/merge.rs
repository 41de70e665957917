//! First-login reconciliation of local and cloud data.
//!
//! Sessions merge by id with last-write-wins on `updatedAt`, falling back to
//! `createdAt` and then to the epoch. There are no vector clocks and no
//! per-field merge: one whole session wins. Photos are never deleted here;
//! the merge only decides which local photos still need uploading.

use booth_store::{Photo, Session};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// How to reconcile when both this device and the cloud have data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Per-session last-write-wins, photos unioned
    #[default]
    Merge,
    /// Adopt the cloud session list; local photos stay as they are
    ReplaceWithCloud,
    /// Local sessions are authoritative and get pushed
    KeepLocal,
}

impl MergeStrategy {
    pub fn needs_cloud_sessions(self) -> bool {
        !matches!(self, MergeStrategy::KeepLocal)
    }

    pub fn needs_cloud_photos(self) -> bool {
        matches!(self, MergeStrategy::Merge)
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::Merge => "merge",
            MergeStrategy::ReplaceWithCloud => "replace-with-cloud",
            MergeStrategy::KeepLocal => "keep-local",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(MergeStrategy::Merge),
            "replace-with-cloud" => Ok(MergeStrategy::ReplaceWithCloud),
            "keep-local" => Ok(MergeStrategy::KeepLocal),
            other => Err(format!(
                "Unknown merge strategy '{}' (expected merge, replace-with-cloud or keep-local)",
                other
            )),
        }
    }
}

/// What the cloud holds, as far as a merge cares
#[derive(Debug, Clone, Default)]
pub struct CloudSnapshot {
    pub sessions: Vec<Session>,
    pub photo_ids: HashSet<String>,
}

/// Resolved outcome of a merge, before it is applied
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// Becomes the local session list and is pushed to the cloud
    pub sessions: Vec<Session>,
    /// Local photos to queue for upload
    pub photos_to_queue: Vec<Photo>,
}

/// Milliseconds since the epoch the session was last written.
///
/// Uses `updatedAt` if set, else `createdAt`, else 0. A value that is present
/// but cannot be read also counts as 0.
pub fn effective_timestamp(session: &Session) -> i64 {
    let raw = [&session.updated_at, &session.created_at]
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty());

    raw.map(|value| parse_timestamp(value)).unwrap_or(0)
}

fn parse_timestamp(value: &str) -> i64 {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.timestamp_millis();
    }
    value.parse::<i64>().unwrap_or_else(|_| {
        log::debug!("Unreadable session timestamp '{}', treating as epoch", value);
        0
    })
}

/// Cloud sessions seed the result; a local session replaces its cloud
/// counterpart only when strictly newer, and local-only sessions are appended.
pub fn merge_sessions(local: &[Session], cloud: &[Session]) -> Vec<Session> {
    let mut merged: Vec<Session> = cloud.to_vec();

    for session in local {
        match merged.iter().position(|s| s.id == session.id) {
            Some(index) => {
                if effective_timestamp(session) > effective_timestamp(&merged[index]) {
                    merged[index] = session.clone();
                }
            }
            None => merged.push(session.clone()),
        }
    }

    merged
}

/// Resolves `strategy` against local data and what the cloud returned.
///
/// `cloud` is ignored for keep-local, and its photo ids only matter for merge.
pub fn plan(
    strategy: MergeStrategy,
    local_sessions: &[Session],
    local_photos: &[Photo],
    cloud: &CloudSnapshot,
) -> MergePlan {
    match strategy {
        MergeStrategy::ReplaceWithCloud => MergePlan {
            sessions: cloud.sessions.clone(),
            photos_to_queue: Vec::new(),
        },
        MergeStrategy::KeepLocal => MergePlan {
            sessions: local_sessions.to_vec(),
            photos_to_queue: local_photos
                .iter()
                .filter(|p| !p.uploaded_to_cloud)
                .cloned()
                .collect(),
        },
        MergeStrategy::Merge => MergePlan {
            sessions: merge_sessions(local_sessions, &cloud.sessions),
            photos_to_queue: local_photos
                .iter()
                .filter(|p| !cloud.photo_ids.contains(&p.id))
                .cloned()
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, name: &str, updated_at: Option<&str>) -> Session {
        let mut session = Session::new(name);
        session.id = id.to_string();
        session.created_at = None;
        session.updated_at = updated_at.map(str::to_string);
        session
    }

    fn photo(id: &str, uploaded: bool) -> Photo {
        let mut photo = Photo::new("data:image/jpeg;base64,AAAA", None);
        photo.id = id.to_string();
        photo.uploaded_to_cloud = uploaded;
        photo
    }

    #[test]
    fn test_newer_local_wins() {
        let local = vec![session("A", "local", Some("2024-05-02T10:00:00.000Z"))];
        let cloud = vec![session("A", "cloud", Some("2024-05-01T10:00:00.000Z"))];
        assert_eq!(merge_sessions(&local, &cloud)[0].name, "local");
    }

    #[test]
    fn test_older_local_loses() {
        let local = vec![session("A", "local", Some("2024-05-01T10:00:00.000Z"))];
        let cloud = vec![session("A", "cloud", Some("2024-05-02T10:00:00.000Z"))];
        assert_eq!(merge_sessions(&local, &cloud)[0].name, "cloud");
    }

    #[test]
    fn test_tie_goes_to_cloud() {
        let stamp = Some("2024-05-01T10:00:00.000Z");
        let local = vec![session("A", "local", stamp)];
        let cloud = vec![session("A", "cloud", stamp)];
        assert_eq!(merge_sessions(&local, &cloud), cloud);
    }

    #[test]
    fn test_timestamp_fallbacks() {
        let mut created_only = session("A", "x", None);
        created_only.created_at = Some("1970-01-01T00:00:01.000Z".to_string());
        assert_eq!(effective_timestamp(&created_only), 1000);

        assert_eq!(effective_timestamp(&session("A", "x", None)), 0);
        assert_eq!(effective_timestamp(&session("A", "x", Some("garbage"))), 0);
        assert_eq!(effective_timestamp(&session("A", "x", Some("1700000000000"))), 1_700_000_000_000);

        // Undated local never beats a dated cloud copy
        let local = vec![session("A", "local", None)];
        let cloud = vec![session("A", "cloud", Some("2024-05-01T10:00:00.000Z"))];
        assert_eq!(merge_sessions(&local, &cloud)[0].name, "cloud");
    }

    #[test]
    fn test_merge_keeps_both_sides() {
        let local = vec![
            session("L1", "only local", None),
            session("B", "shared", Some("2024-01-01T00:00:00Z")),
        ];
        let cloud = vec![
            session("C1", "only cloud", None),
            session("B", "shared cloud", Some("2023-01-01T00:00:00Z")),
        ];

        let merged = merge_sessions(&local, &cloud);
        let ids: Vec<_> = merged.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "B", "L1"]);
        assert_eq!(merged[1].name, "shared");
    }

    #[test]
    fn test_keep_local_preserves_every_local_session() {
        let local = vec![session("A", "mine", None), session("B", "also mine", None)];
        let cloud = CloudSnapshot {
            sessions: vec![session("A", "theirs", Some("2030-01-01T00:00:00Z"))],
            photo_ids: HashSet::new(),
        };
        let photos = vec![photo("p1", true), photo("p2", false)];

        let plan = plan(MergeStrategy::KeepLocal, &local, &photos, &cloud);
        assert_eq!(plan.sessions, local);
        assert_eq!(plan.photos_to_queue.len(), 1);
        assert_eq!(plan.photos_to_queue[0].id, "p2");
    }

    #[test]
    fn test_replace_with_cloud() {
        let local = vec![session("A", "mine", None)];
        let cloud = CloudSnapshot {
            sessions: vec![session("Z", "theirs", None)],
            photo_ids: HashSet::new(),
        };
        let plan = plan(MergeStrategy::ReplaceWithCloud, &local, &[photo("p1", false)], &cloud);
        assert_eq!(plan.sessions, cloud.sessions);
        assert!(plan.photos_to_queue.is_empty());
    }

    #[test]
    fn test_merge_queues_photos_missing_in_cloud() {
        let cloud = CloudSnapshot {
            sessions: Vec::new(),
            photo_ids: ["p1".to_string()].into_iter().collect(),
        };
        let photos = vec![photo("p1", false), photo("p2", true), photo("p3", false)];

        let plan = plan(MergeStrategy::Merge, &[], &photos, &cloud);
        let queued: Vec<_> = plan.photos_to_queue.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(queued, vec!["p2", "p3"]);
    }

    #[test]
    fn test_strategy_names() {
        for strategy in [
            MergeStrategy::Merge,
            MergeStrategy::ReplaceWithCloud,
            MergeStrategy::KeepLocal,
        ] {
            assert_eq!(strategy.to_string().parse::<MergeStrategy>(), Ok(strategy));
        }
        assert!("newest".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::default(), MergeStrategy::Merge);
    }
}
