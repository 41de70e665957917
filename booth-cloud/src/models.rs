use booth_store::{Photo, UserProfile};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

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

/// Bearer credential plus the identity it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub token: String,
    pub user: UserProfile,
}

/// Session as stored remotely: the design is a reference, settings are raw JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSession {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "designUrl")]
    pub design_url: Option<String>,
    #[serde(default)]
    pub settings: Value,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<String>,
}

/// Metadata accompanying a photo upload
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoUpload {
    pub photo_id: String,
    pub session_id: Option<String>,
    pub is_strip: bool,
    pub is_collage: bool,
    pub strip_photos: Option<Vec<String>>,
    pub created_at: String,
}

impl From<&Photo> for PhotoUpload {
    fn from(photo: &Photo) -> Self {
        Self {
            photo_id: photo.id.clone(),
            session_id: photo.session_id.clone(),
            is_strip: photo.is_strip,
            is_collage: photo.is_collage,
            strip_photos: photo.strip_photos.clone(),
            created_at: photo.created_at.clone(),
        }
    }
}

/// Result of a confirmed photo upload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPhoto {
    #[serde(deserialize_with = "deserialize_id")]
    pub photo_id: String,
    pub photo_url: String,
}

/// Remote photo listing entry; the image itself is loaded lazily from `photo_url`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoMeta {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "photoUrl")]
    pub photo_url: String,
    #[serde(default, alias = "isStrip")]
    pub is_strip: bool,
    #[serde(default, alias = "isCollage")]
    pub is_collage: bool,
    #[serde(default, alias = "stripPhotos")]
    pub strip_photos: Option<Vec<String>>,
    #[serde(default, alias = "createdAt")]
    pub created_at: String,
    /// SHA-256 of the uploaded bytes, when the backend records one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl From<PhotoMeta> for Photo {
    /// Cloud-only representation of a remote photo
    fn from(meta: PhotoMeta) -> Self {
        Photo {
            id: meta.id,
            data: None,
            storage_url: Some(meta.photo_url.clone()),
            cloud_url: Some(meta.photo_url),
            session_id: meta.session_id,
            is_strip: meta.is_strip,
            is_collage: meta.is_collage,
            strip_photos: meta.strip_photos,
            uploaded_to_cloud: true,
            created_at: meta.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_session_from_server_row() {
        let row = json!({
            "id": 1712000000000u64,
            "user_id": 7,
            "name": "Party",
            "design_url": null,
            "settings": { "opacity": 50 },
            "created_at": "2024-04-01T10:00:00Z",
            "updated_at": "2024-04-02T10:00:00Z"
        });
        let session: RemoteSession = serde_json::from_value(row).unwrap();

        assert_eq!(session.id, "1712000000000");
        assert_eq!(session.settings["opacity"], 50);
        assert_eq!(session.updated_at.as_deref(), Some("2024-04-02T10:00:00Z"));
    }

    #[test]
    fn test_photo_meta_into_cloud_only_photo() {
        let meta: PhotoMeta = serde_json::from_value(json!({
            "id": "p1",
            "session_id": "s1",
            "photo_url": "/.netlify/blobs/photos/u/p1.jpg",
            "is_strip": true,
            "is_collage": false,
            "created_at": "2024-04-01T10:00:00Z"
        }))
        .unwrap();

        let photo = Photo::from(meta);
        assert!(photo.uploaded_to_cloud);
        assert!(photo.data.is_none());
        assert!(photo.is_strip);
        assert_eq!(photo.display_url(), Some("/.netlify/blobs/photos/u/p1.jpg"));
    }
}
