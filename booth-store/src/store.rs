use crate::models::{Photo, QueueEntry, Session, UserProfile, Video};
use crate::schema::init_store_schema;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Storage keys, shared with the browser build of the booth
pub mod keys {
    pub const SESSIONS: &str = "photobooth-sessions";
    pub const ACTIVE_SESSION: &str = "photobooth-active-session";
    pub const PHOTOS: &str = "photobooth-photos";
    pub const VIDEOS: &str = "photobooth-videos";
    pub const SYNC_QUEUE: &str = "photobooth-sync-queue";
    pub const AUTH_TOKEN: &str = "photobooth-auth-token";
    pub const AUTH_USER: &str = "photobooth-auth-user";
    pub const LAST_SYNC: &str = "photobooth-last-sync";
}

/// Error type for local store operations
#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    /// Writing `key` would grow the store to `needed` bytes, above `quota`
    QuotaExceeded { key: String, needed: u64, quota: u64 },
    NotFound(String),
    /// The connection mutex was poisoned by a panicking writer
    Lock,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::QuotaExceeded { key, needed, quota } => write!(
                f,
                "Storage quota exceeded writing '{}': {} bytes needed, {} allowed",
                key, needed, quota
            ),
            StoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StoreError::Lock => write!(f, "Store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

/// Local store limits
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Total bytes all values may occupy; `0` disables the check
    pub quota_bytes: u64,
    /// How many photos survive a quota trim
    pub max_photos_after_trim: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 5 * 1024 * 1024,
            max_photos_after_trim: 100,
        }
    }
}

/// Key/value persistence for everything that exists on this device.
///
/// Lists are stored wholesale under one key each, like the browser storage
/// the booth started on. All writes complete before they return.
pub struct LocalStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl LocalStore {
    /// Opens (or creates) the store at the given SQLite file
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        log::debug!("Opened local store at {}", path.as_ref().display());
        Self::with_connection(conn, config)
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
        init_store_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    // ---------------------------------------------------------------------
    // Raw key/value access
    // ---------------------------------------------------------------------

    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Writes a value, failing with `QuotaExceeded` if the store would outgrow its quota
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;

        if self.config.quota_bytes > 0 {
            let others: i64 = conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_store WHERE key != ?1",
                params![key],
                |row| row.get(0),
            )?;
            let needed = others.max(0) as u64 + value.len() as u64;
            if needed > self.config.quota_bytes {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota: self.config.quota_bytes,
                });
            }
        }

        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Reads a JSON value. Unparsable content is logged and treated as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::error!("Error loading '{}': {}", key, e);
                Ok(None)
            }
        }
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json)
    }

    /// Reads a JSON array element by element; unreadable elements are logged
    /// and skipped so one bad entry never hides the rest of the list.
    fn get_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StoreError> {
        let Some(Value::Array(items)) = self.get_json::<Value>(key)? else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value(item) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::error!("Skipping unreadable entry {} of '{}': {}", index, key, e);
                    None
                }
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    pub fn sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.get_list(keys::SESSIONS)
    }

    /// Overwrites the whole session list
    pub fn save_sessions(&self, sessions: &[Session]) -> Result<(), StoreError> {
        self.set_json(keys::SESSIONS, sessions)?;
        log::debug!("Sessions saved to storage: {} sessions", sessions.len());
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions()?.into_iter().find(|s| s.id == id))
    }

    /// Creates a session with default settings merged under `settings`.
    ///
    /// Without a name the session is called `Session N`.
    pub fn create_session(
        &self,
        name: Option<&str>,
        design: Option<String>,
        settings: Option<&Value>,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions()?;

        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("Session {}", sessions.len() + 1),
        };
        let mut session = Session::new(name);
        session.design = design;
        if let Some(overrides) = settings {
            session.settings = session.settings.merged_with(overrides)?;
        }

        sessions.push(session.clone());
        self.save_sessions(&sessions)?;
        log::info!("Created session {} ({})", session.name, session.id);
        Ok(session)
    }

    /// Applies `change` to the stored session and bumps its `updatedAt`
    pub fn update_session<F>(&self, id: &str, change: F) -> Result<Session, StoreError>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions()?;
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("Session {}", id)))?;

        change(session);
        session.touch();
        let updated = session.clone();

        self.save_sessions(&sessions)?;
        Ok(updated)
    }

    /// Replaces the session with the same id, or appends it
    pub fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions()?;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        self.save_sessions(&sessions)
    }

    /// Deletes a session; clears the active pointer if it pointed there.
    ///
    /// Returns `false` if no such session existed.
    pub fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions()?;
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Ok(false);
        }
        self.save_sessions(&sessions)?;

        if self.active_session_id()?.as_deref() == Some(id) {
            self.set_active_session_id(None)?;
        }
        Ok(true)
    }

    pub fn active_session_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self.get_raw(keys::ACTIVE_SESSION)?.filter(|id| !id.is_empty()))
    }

    pub fn set_active_session_id(&self, id: Option<&str>) -> Result<(), StoreError> {
        match id {
            Some(id) => self.set_raw(keys::ACTIVE_SESSION, id),
            None => self.remove(keys::ACTIVE_SESSION),
        }
    }

    /// The session the active pointer refers to, if it still exists
    pub fn active_session(&self) -> Result<Option<Session>, StoreError> {
        match self.active_session_id()? {
            Some(id) => self.get_session(&id),
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Photos
    // ---------------------------------------------------------------------

    pub fn photos(&self) -> Result<Vec<Photo>, StoreError> {
        self.get_list(keys::PHOTOS)
    }

    /// Overwrites the photo list.
    ///
    /// When the quota is exhausted the list is cut down to the most recent
    /// photos and written once more.
    pub fn save_photos(&self, photos: &[Photo]) -> Result<(), StoreError> {
        match self.set_json(keys::PHOTOS, photos) {
            Ok(()) => {
                log::debug!("Photos saved to storage: {} photos", photos.len());
                Ok(())
            }
            Err(StoreError::QuotaExceeded { needed, quota, .. }) => {
                log::warn!(
                    "Storage quota exceeded ({} of {} bytes), keeping the {} most recent photos",
                    needed,
                    quota,
                    self.config.max_photos_after_trim
                );
                let trimmed = most_recent(photos, self.config.max_photos_after_trim);
                self.set_json(keys::PHOTOS, &trimmed)?;
                log::info!("Trimmed photos to {}", trimmed.len());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_photo(&self, id: &str) -> Result<Option<Photo>, StoreError> {
        Ok(self.photos()?.into_iter().find(|p| p.id == id))
    }

    pub fn add_photo(&self, photo: &Photo) -> Result<(), StoreError> {
        let mut photos = self.photos()?;
        photos.push(photo.clone());
        self.save_photos(&photos)
    }

    /// Applies `change` to the stored photo
    pub fn update_photo<F>(&self, id: &str, change: F) -> Result<Photo, StoreError>
    where
        F: FnOnce(&mut Photo),
    {
        let mut photos = self.photos()?;
        let photo = photos
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("Photo {}", id)))?;
        change(photo);
        let updated = photo.clone();
        self.save_photos(&photos)?;
        Ok(updated)
    }

    /// Removes a photo; returns it if it existed
    pub fn delete_photo(&self, id: &str) -> Result<Option<Photo>, StoreError> {
        let mut photos = self.photos()?;
        let Some(pos) = photos.iter().position(|p| p.id == id) else {
            return Ok(None);
        };
        let removed = photos.remove(pos);
        self.save_photos(&photos)?;
        Ok(Some(removed))
    }

    /// Removes every photo; returns how many there were
    pub fn clear_photos(&self) -> Result<usize, StoreError> {
        let count = self.photos()?.len();
        self.remove(keys::PHOTOS)?;
        Ok(count)
    }

    // ---------------------------------------------------------------------
    // Videos
    // ---------------------------------------------------------------------

    pub fn videos(&self) -> Result<Vec<Video>, StoreError> {
        self.get_list(keys::VIDEOS)
    }

    pub fn save_videos(&self, videos: &[Video]) -> Result<(), StoreError> {
        self.set_json(keys::VIDEOS, videos)
    }

    pub fn add_video(&self, video: &Video) -> Result<(), StoreError> {
        let mut videos = self.videos()?;
        videos.push(video.clone());
        self.save_videos(&videos)
    }

    pub fn delete_video(&self, id: &str) -> Result<bool, StoreError> {
        let mut videos = self.videos()?;
        let before = videos.len();
        videos.retain(|v| v.id != id);
        if videos.len() == before {
            return Ok(false);
        }
        self.save_videos(&videos)?;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Offline queue
    // ---------------------------------------------------------------------

    pub fn queue(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.get_list(keys::SYNC_QUEUE)
    }

    pub fn save_queue(&self, entries: &[QueueEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return self.remove(keys::SYNC_QUEUE);
        }
        self.set_json(keys::SYNC_QUEUE, entries)
    }

    // ---------------------------------------------------------------------
    // Auth cache
    // ---------------------------------------------------------------------

    pub fn auth_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.get_raw(keys::AUTH_TOKEN)?.filter(|t| !t.is_empty()))
    }

    pub fn set_auth_token(&self, token: Option<&str>) -> Result<(), StoreError> {
        match token {
            Some(token) => self.set_raw(keys::AUTH_TOKEN, token),
            None => self.remove(keys::AUTH_TOKEN),
        }
    }

    pub fn auth_user(&self) -> Result<Option<UserProfile>, StoreError> {
        self.get_json(keys::AUTH_USER)
    }

    pub fn set_auth_user(&self, user: Option<&UserProfile>) -> Result<(), StoreError> {
        match user {
            Some(user) => self.set_json(keys::AUTH_USER, user),
            None => self.remove(keys::AUTH_USER),
        }
    }

    /// Forgets the stored credential and profile
    pub fn clear_auth(&self) -> Result<(), StoreError> {
        self.remove(keys::AUTH_TOKEN)?;
        self.remove(keys::AUTH_USER)
    }

    pub fn last_sync(&self) -> Result<Option<String>, StoreError> {
        self.get_raw(keys::LAST_SYNC)
    }

    pub fn set_last_sync(&self, timestamp: &str) -> Result<(), StoreError> {
        self.set_raw(keys::LAST_SYNC, timestamp)
    }

    /// Whether this device holds any sessions or photos
    pub fn has_local_data(&self) -> Result<bool, StoreError> {
        Ok(!self.sessions()?.is_empty() || !self.photos()?.is_empty())
    }
}

/// Newest-first copy of `photos`, cut to `keep` entries
fn most_recent(photos: &[Photo], keep: usize) -> Vec<Photo> {
    let mut sorted = photos.to_vec();
    sorted.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    sorted.truncate(keep);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> LocalStore {
        LocalStore::open_in_memory(StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_empty_store_reads_empty_lists() {
        let store = store();
        assert!(store.sessions().unwrap().is_empty());
        assert!(store.photos().unwrap().is_empty());
        assert!(store.queue().unwrap().is_empty());
        assert_eq!(store.active_session_id().unwrap(), None);
        assert!(!store.has_local_data().unwrap());
    }

    #[test]
    fn test_corrupt_json_reads_as_empty() {
        let store = store();
        store.set_raw(keys::PHOTOS, "{not json").unwrap();
        assert!(store.photos().unwrap().is_empty());
    }

    #[test]
    fn test_sessions_with_null_settings_survive_writes() {
        let store = store();
        let stored = json!([
            { "id": "s1", "name": "Legacy", "settings": null },
            { "id": "s2", "name": "Blank size", "settings": { "size": null, "text": { "fontSize": null } } },
            { "id": "s3", "name": "Current", "settings": { "layout": { "photoCount": 4 } } },
            { "name": "No id" }
        ]);
        store.set_raw(keys::SESSIONS, &stored.to_string()).unwrap();

        let sessions = store.sessions().unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
        assert_eq!(sessions[1].settings.size, 100);
        assert_eq!(sessions[1].settings.text.font_size, 24);
        assert_eq!(sessions[2].settings.layout.photo_count, 4);

        store.create_session(Some("New"), None, None).unwrap();
        let names: Vec<_> = store.sessions().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Legacy", "Blank size", "Current", "New"]);
    }

    #[test]
    fn test_create_session_names_and_defaults() {
        let store = store();
        let first = store.create_session(None, None, None).unwrap();
        let second = store
            .create_session(Some("Wedding"), None, Some(&json!({ "border": { "enabled": true } })))
            .unwrap();

        assert_eq!(first.name, "Session 1");
        assert_eq!(second.name, "Wedding");
        assert!(second.settings.border.enabled);
        assert_eq!(second.settings.border.style, "solid");
        assert_eq!(store.sessions().unwrap().len(), 2);
    }

    #[test]
    fn test_update_session_bumps_timestamp() {
        let store = store();
        let mut session = store.create_session(Some("A"), None, None).unwrap();
        session.updated_at = Some("2000-01-01T00:00:00.000Z".to_string());
        store.upsert_session(&session).unwrap();

        let updated = store
            .update_session(&session.id, |s| s.name = "B".to_string())
            .unwrap();

        assert_eq!(updated.name, "B");
        assert!(updated.updated_at.unwrap().as_str() > "2000-01-01T00:00:00.000Z");

        let missing = store.update_session("nope", |_| {});
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_active_session_clears_pointer() {
        let store = store();
        let session = store.create_session(Some("A"), None, None).unwrap();
        store.set_active_session_id(Some(&session.id)).unwrap();
        assert_eq!(store.active_session().unwrap().unwrap().id, session.id);

        assert!(store.delete_session(&session.id).unwrap());
        assert_eq!(store.active_session_id().unwrap(), None);
        assert!(!store.delete_session(&session.id).unwrap());
    }

    #[test]
    fn test_photo_crud() {
        let store = store();
        let photo = Photo::new("data:image/jpeg;base64,AAAA", None);
        store.add_photo(&photo).unwrap();

        let updated = store
            .update_photo(&photo.id, |p| {
                p.uploaded_to_cloud = true;
                p.cloud_url = Some("https://cloud/x.jpg".to_string());
            })
            .unwrap();
        assert!(updated.uploaded_to_cloud);
        assert!(store.get_photo(&photo.id).unwrap().unwrap().uploaded_to_cloud);

        let removed = store.delete_photo(&photo.id).unwrap();
        assert_eq!(removed.map(|p| p.id), Some(photo.id.clone()));
        assert_eq!(store.delete_photo(&photo.id).unwrap(), None);
    }

    #[test]
    fn test_quota_trims_to_most_recent_photos() {
        let store = LocalStore::open_in_memory(StoreConfig {
            quota_bytes: 2_000,
            max_photos_after_trim: 3,
        })
        .unwrap();

        let mut photos = Vec::new();
        for i in 0..10 {
            let mut photo = Photo::new("x".repeat(150), None);
            photo.created_at = format!("2024-01-01T00:00:{:02}.000Z", i);
            photos.push(photo);
        }
        store.save_photos(&photos).unwrap();

        let kept = store.photos().unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].created_at, "2024-01-01T00:00:09.000Z");
        assert_eq!(kept[2].created_at, "2024-01-01T00:00:07.000Z");
    }

    #[test]
    fn test_quota_error_on_other_keys() {
        let store = LocalStore::open_in_memory(StoreConfig {
            quota_bytes: 10,
            max_photos_after_trim: 100,
        })
        .unwrap();

        let result = store.set_raw(keys::LAST_SYNC, "2024-01-01T00:00:00Z");
        assert!(matches!(result, Err(StoreError::QuotaExceeded { .. })));
    }

    #[test]
    fn test_auth_cache() {
        let store = store();
        let user = UserProfile {
            id: "u1".to_string(),
            email: "a@b.c".to_string(),
            display_name: None,
        };
        store.set_auth_token(Some("tok")).unwrap();
        store.set_auth_user(Some(&user)).unwrap();
        assert_eq!(store.auth_token().unwrap().as_deref(), Some("tok"));
        assert_eq!(store.auth_user().unwrap(), Some(user));

        store.clear_auth().unwrap();
        assert_eq!(store.auth_token().unwrap(), None);
        assert_eq!(store.auth_user().unwrap(), None);
    }

    #[test]
    fn test_videos() {
        let store = store();
        let video = Video {
            id: "v1".to_string(),
            url: "blob:abc".to_string(),
            session_id: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        };
        store.add_video(&video).unwrap();
        assert_eq!(store.videos().unwrap().len(), 1);
        assert!(store.delete_video("v1").unwrap());
        assert!(store.videos().unwrap().is_empty());
    }
}
