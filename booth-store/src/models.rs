use crate::settings::SessionSettings;
use chrono::SecondsFormat;
use serde::{Deserialize, Deserializer, Serialize};

/// Generates a new time-ordered identifier
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Current time as an RFC 3339 timestamp with millisecond precision
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accepts ids written as JSON strings or (by older clients) as numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// Reads `null` as the type's default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_settings<'de, D>(deserializer: D) -> Result<SessionSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(SessionSettings::from_stored(&raw))
}

/// A named configuration bundle the booth captures with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Overlay artwork as a data URL
    #[serde(default)]
    pub design: Option<String>,
    #[serde(default, deserialize_with = "deserialize_settings")]
    pub settings: SessionSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_iso();
        Self {
            id: new_id(),
            name: name.into(),
            design: None,
            settings: SessionSettings::default(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        }
    }

    /// Marks the session as modified now
    pub fn touch(&mut self) {
        self.updated_at = Some(now_iso());
    }
}

/// A captured artifact: single shot, strip or collage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Image payload as a data URL (local representation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_url: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_strip: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_collage: bool,
    /// Raw captures a strip was composed from, in order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_photos: Option<Vec<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub uploaded_to_cloud: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
}

impl Photo {
    /// Creates a local-only photo from a captured payload
    pub fn new(data: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            id: new_id(),
            data: Some(data.into()),
            storage_url: None,
            cloud_url: None,
            session_id,
            is_strip: false,
            is_collage: false,
            strip_photos: None,
            uploaded_to_cloud: false,
            created_at: now_iso(),
        }
    }

    /// URL the gallery should load the image from, preferring the local payload
    pub fn display_url(&self) -> Option<&str> {
        self.data
            .as_deref()
            .or(self.cloud_url.as_deref())
            .or(self.storage_url.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

/// Cached identity, shown while offline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Photo,
    Session,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Photo => write!(f, "photo"),
            QueueKind::Session => write!(f, "session"),
        }
    }
}

/// Payload of a pending sync operation
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Photo(Photo),
    Session(Session),
}

impl QueueItem {
    pub fn kind(&self) -> QueueKind {
        match self {
            QueueItem::Photo(_) => QueueKind::Photo,
            QueueItem::Session(_) => QueueKind::Session,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            QueueItem::Photo(photo) => &photo.id,
            QueueItem::Session(session) => &session.id,
        }
    }
}

/// One entry of the offline queue: `{type, data, queuedAt}` on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawQueueEntry", into = "RawQueueEntry")]
pub struct QueueEntry {
    pub item: QueueItem,
    pub queued_at: String,
}

impl QueueEntry {
    pub fn new(item: QueueItem) -> Self {
        Self {
            item,
            queued_at: now_iso(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.item.kind()
    }

    pub fn id(&self) -> &str {
        self.item.id()
    }

    /// Whether this entry targets the same `(type, id)` as another
    pub fn same_target(&self, kind: QueueKind, id: &str) -> bool {
        self.kind() == kind && self.id() == id
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQueueEntry {
    #[serde(rename = "type")]
    kind: QueueKind,
    data: serde_json::Value,
    #[serde(default)]
    queued_at: String,
}

impl TryFrom<RawQueueEntry> for QueueEntry {
    type Error = serde_json::Error;

    fn try_from(raw: RawQueueEntry) -> Result<Self, Self::Error> {
        let item = match raw.kind {
            QueueKind::Photo => QueueItem::Photo(serde_json::from_value(raw.data)?),
            QueueKind::Session => QueueItem::Session(serde_json::from_value(raw.data)?),
        };
        Ok(QueueEntry {
            item,
            queued_at: raw.queued_at,
        })
    }
}

impl From<QueueEntry> for RawQueueEntry {
    fn from(entry: QueueEntry) -> Self {
        let kind = entry.kind();
        // Both payload types are plain data and always serialize
        let data = match entry.item {
            QueueItem::Photo(photo) => serde_json::to_value(photo),
            QueueItem::Session(session) => serde_json::to_value(session),
        }
        .unwrap_or(serde_json::Value::Null);
        RawQueueEntry {
            kind,
            data,
            queued_at: entry.queued_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_photo_id_is_accepted() {
        let photo: Photo = serde_json::from_value(json!({
            "id": 1712345678901u64,
            "data": "data:image/jpeg;base64,AAAA",
            "sessionId": null,
            "createdAt": "2024-04-05T10:00:00.000Z"
        }))
        .unwrap();

        assert_eq!(photo.id, "1712345678901");
        assert!(!photo.uploaded_to_cloud);
        assert!(!photo.is_strip);
    }

    #[test]
    fn test_queue_entry_wire_shape() {
        let photo = Photo::new("data:image/jpeg;base64,AAAA", Some("s1".to_string()));
        let entry = QueueEntry::new(QueueItem::Photo(photo.clone()));

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "photo");
        assert_eq!(value["data"]["id"], photo.id.as_str());
        assert_eq!(value["data"]["sessionId"], "s1");
        assert!(value["queuedAt"].is_string());

        let back: QueueEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_session_without_settings_gets_defaults() {
        let session: Session = serde_json::from_value(json!({
            "id": "abc",
            "name": "Old",
            "createdAt": "2023-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(session.settings, SessionSettings::default());
        assert_eq!(session.updated_at, None);
        assert_eq!(session.design, None);
    }

    #[test]
    fn test_null_session_fields_fall_back_to_defaults() {
        let session: Session = serde_json::from_value(json!({
            "id": "legacy",
            "name": null,
            "settings": null
        }))
        .unwrap();
        assert_eq!(session.name, "");
        assert_eq!(session.settings, SessionSettings::default());

        let session: Session = serde_json::from_value(json!({
            "id": "nan",
            "name": "Blank size",
            "settings": { "size": null, "opacity": "high", "layout": { "photoCount": 4, "spacing": "wide" } }
        }))
        .unwrap();
        assert_eq!(session.settings.size, 100);
        assert_eq!(session.settings.opacity, 100);
        assert_eq!(session.settings.layout.photo_count, 4);
        assert_eq!(session.settings.layout.spacing, 10);
    }

    #[test]
    fn test_display_url_prefers_local_payload() {
        let mut photo = Photo::new("data:image/png;base64,AA", None);
        photo.cloud_url = Some("https://cloud/p.jpg".to_string());
        assert_eq!(photo.display_url(), Some("data:image/png;base64,AA"));

        photo.data = None;
        assert_eq!(photo.display_url(), Some("https://cloud/p.jpg"));
    }
}
