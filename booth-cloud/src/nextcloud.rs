//! Nextcloud backend: identity from the Nextcloud account, documents over WebDAV.
//!
//! Layout below the configured remote path:
//!
//! ```text
//! <remote_path>/
//!   active-session.json
//!   sessions/<id>.json
//!   designs/<id>_design.<ext>
//!   photos/<id>.<ext>
//!   photos/<id>.json        metadata incl. SHA-256 checksum
//! ```

use crate::error::RemoteError;
use crate::models::{Credential, PhotoMeta, PhotoUpload, RemoteSession, UploadedPhoto};
use crate::payload::{ensure_within_limit, sha256_hex, DataUrl, MAX_UPLOAD_BYTES};
use crate::service::{RemoteDataService, SessionWatcher};
use async_trait::async_trait;
use booth_store::UserProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const USER_AGENT: &str = concat!("PhotoboothSync/", env!("CARGO_PKG_VERSION"));

/// Configuration for the Nextcloud backend
#[derive(Debug, Clone)]
pub struct NextcloudConfig {
    pub server_url: String,
    pub remote_path: String,
    pub timeout_secs: u64,
    pub max_upload_bytes: usize,
}

impl Default for NextcloudConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            remote_path: "/Photobooth".to_string(),
            timeout_secs: 60,
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSessionDoc {
    active_session_id: Option<String>,
}

/// Shared between the backend and its session watcher
struct DavContext {
    config: NextcloudConfig,
    credential: RwLock<Option<Credential>>,
}

impl DavContext {
    fn credential(&self) -> Result<Credential, RemoteError> {
        self.credential
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| RemoteError::Unauthorized("Not signed in to Nextcloud".to_string()))
    }

    fn webdav_url(&self, username: &str) -> String {
        format!(
            "{}/remote.php/dav/files/{}",
            self.config.server_url.trim_end_matches('/'),
            username
        )
    }

    /// Create a WebDAV client for the signed-in user
    fn create_client(&self) -> Result<reqwest_dav::Client, RemoteError> {
        let credential = self.credential()?;
        reqwest_dav::ClientBuilder::new()
            .set_host(self.webdav_url(&credential.user.id))
            .set_auth(reqwest_dav::Auth::Basic(
                credential.user.id.clone(),
                credential.token.clone(),
            ))
            .build()
            .map_err(|e| RemoteError::Network(format!("WebDAV client error: {:?}", e)))
    }

    fn path(&self, relative: &str) -> String {
        format!("{}/{}", self.config.remote_path.trim_end_matches('/'), relative)
    }

    /// Files in a directory with their ETags; a missing directory is empty
    async fn list_files(
        &self,
        client: &reqwest_dav::Client,
        dir: &str,
    ) -> Result<Vec<(String, String)>, RemoteError> {
        let list = match client.list(&self.path(dir), reqwest_dav::Depth::Number(1)).await {
            Ok(list) => list,
            Err(e) => {
                let err = dav_error(e);
                if matches!(err, RemoteError::NotFound(_)) {
                    log::debug!("Directory {} doesn't exist yet", dir);
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };

        let mut files = Vec::new();
        for item in list {
            if let reqwest_dav::list_cmd::ListEntity::File(file) = item {
                let filename = file
                    .href
                    .trim_end_matches('/')
                    .split('/')
                    .last()
                    .unwrap_or("")
                    .to_string();
                if !filename.is_empty() {
                    files.push((filename, file.tag.unwrap_or_default()));
                }
            }
        }
        Ok(files)
    }
}

/// Maps a WebDAV client error to a remote error kind.
///
/// The DAV client reports unexpected statuses inside its error text
/// (`response_code: 401`), which is all that is needed for classification.
fn dav_error(err: reqwest_dav::Error) -> RemoteError {
    let text = format!("{:?}", err);
    match status_in(&text) {
        Some(status) => RemoteError::from_status(status, text),
        None => RemoteError::Network(text),
    }
}

fn status_in(text: &str) -> Option<u16> {
    let start = text.find("response_code: ")? + "response_code: ".len();
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

pub struct NextcloudBackend {
    ctx: Arc<DavContext>,
    http: reqwest::Client,
}

impl NextcloudBackend {
    pub fn new(config: NextcloudConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Network(format!("Client build failed: {}", e)))?;

        Ok(Self {
            ctx: Arc::new(DavContext {
                config,
                credential: RwLock::new(None),
            }),
            http,
        })
    }

    /// PROPFIND on the booth folder with the given credential
    async fn probe(&self, credential: &Credential) -> Result<bool, RemoteError> {
        let method = reqwest::Method::from_bytes(b"PROPFIND")
            .map_err(|e| RemoteError::Network(format!("Invalid method: {}", e)))?;
        let url = format!("{}/", self.ctx.webdav_url(&credential.user.id));

        let response = self
            .http
            .request(method, url)
            .basic_auth(&credential.user.id, Some(&credential.token))
            .header("Depth", "0")
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("PROPFIND failed: {}", e)))?;

        match response.status().as_u16() {
            200..=299 => Ok(true),
            401 => Ok(false),
            status => Err(RemoteError::from_status(
                status,
                format!("PROPFIND returned {}", status),
            )),
        }
    }

    /// Ensure the booth directory tree exists on the server
    async fn ensure_layout(&self, client: &reqwest_dav::Client) {
        let root = self.ctx.config.remote_path.trim_end_matches('/').to_string();
        for dir in [
            root.clone(),
            format!("{}/sessions", root),
            format!("{}/designs", root),
            format!("{}/photos", root),
        ] {
            // Ignore errors, the directory usually exists already
            if let Err(e) = client.mkcol(&dir).await {
                log::debug!("MKCOL '{}' note: {:?}", dir, e);
            }
        }
    }

    async fn get_bytes(
        &self,
        client: &reqwest_dav::Client,
        relative: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        let response = client.get(&self.ctx.path(relative)).await.map_err(dav_error)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(RemoteError::from_status(status, relative.to_string()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to read response bytes: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        client: &reqwest_dav::Client,
        relative: &str,
    ) -> Result<T, RemoteError> {
        let bytes = self.get_bytes(client, relative).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn put_json<T: Serialize>(
        &self,
        client: &reqwest_dav::Client,
        relative: &str,
        value: &T,
    ) -> Result<(), RemoteError> {
        let body = serde_json::to_vec(value)?;
        client
            .put(&self.ctx.path(relative), body)
            .await
            .map_err(dav_error)
    }

    async fn delete_file(
        &self,
        client: &reqwest_dav::Client,
        relative: &str,
    ) -> Result<(), RemoteError> {
        match client.delete(&self.ctx.path(relative)).await.map_err(dav_error) {
            Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All photo metadata documents
    async fn photo_metas(&self, client: &reqwest_dav::Client) -> Result<Vec<PhotoMeta>, RemoteError> {
        let mut photos = Vec::new();
        for (filename, _) in self.ctx.list_files(client, "photos").await? {
            if !filename.ends_with(".json") {
                continue;
            }
            match self
                .get_json::<PhotoMeta>(client, &format!("photos/{}", filename))
                .await
            {
                Ok(meta) => photos.push(meta),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => log::warn!("Skipping unreadable photo metadata {}: {}", filename, e),
            }
        }
        Ok(photos)
    }
}

#[async_trait]
impl RemoteDataService for NextcloudBackend {
    fn name(&self) -> &'static str {
        "nextcloud"
    }

    fn set_credential(&self, credential: Option<&Credential>) {
        *self
            .ctx
            .credential
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credential.cloned();
    }

    /// Signs in with a login name and an app password
    async fn authenticate(&self, login: &str, app_password: &str) -> Result<Credential, RemoteError> {
        let credential = Credential {
            token: app_password.to_string(),
            user: UserProfile {
                id: login.to_string(),
                email: if login.contains('@') {
                    login.to_string()
                } else {
                    String::new()
                },
                display_name: None,
            },
        };

        if !self.probe(&credential).await? {
            return Err(RemoteError::Unauthorized(
                "Invalid login name or app password".to_string(),
            ));
        }

        self.set_credential(Some(&credential));
        let client = self.ctx.create_client()?;
        self.ensure_layout(&client).await;
        log::info!("Signed in to Nextcloud as {}", login);
        Ok(credential)
    }

    async fn register(
        &self,
        _email: &str,
        _password: &str,
        _display_name: Option<&str>,
    ) -> Result<Credential, RemoteError> {
        Err(RemoteError::Unsupported(
            "Accounts are created on the Nextcloud server".to_string(),
        ))
    }

    async fn verify(&self, credential: &Credential) -> Result<Option<UserProfile>, RemoteError> {
        if self.probe(credential).await? {
            Ok(Some(credential.user.clone()))
        } else {
            Ok(None)
        }
    }

    /// Deletes the app password so it can't be used again
    async fn revoke(&self, credential: &Credential) -> Result<(), RemoteError> {
        let url = format!(
            "{}/ocs/v2.php/core/apppassword",
            self.ctx.config.server_url.trim_end_matches('/')
        );
        let response = self
            .http
            .delete(url)
            .basic_auth(&credential.user.id, Some(&credential.token))
            .header("OCS-APIREQUEST", "true")
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("Revoke request failed: {}", e)))?;

        match response.status().as_u16() {
            200..=299 | 401 => Ok(()),
            status => Err(RemoteError::from_status(
                status,
                format!("App password revocation returned {}", status),
            )),
        }
    }

    async fn create_or_update_session(
        &self,
        session: &RemoteSession,
    ) -> Result<String, RemoteError> {
        let client = self.ctx.create_client()?;
        let path = format!("sessions/{}.json", session.id);
        match self.put_json(&client, &path, session).await {
            Err(RemoteError::NotFound(_)) | Err(RemoteError::Server { status: 409, .. }) => {
                // Parent folder missing
                self.ensure_layout(&client).await;
                self.put_json(&client, &path, session).await?;
            }
            other => other?,
        }
        Ok(session.id.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<RemoteSession>, RemoteError> {
        let client = self.ctx.create_client()?;
        let mut sessions = Vec::new();
        for (filename, _) in self.ctx.list_files(&client, "sessions").await? {
            if !filename.ends_with(".json") {
                continue;
            }
            match self
                .get_json::<RemoteSession>(&client, &format!("sessions/{}", filename))
                .await
            {
                Ok(session) => sessions.push(session),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => log::warn!("Skipping unreadable session {}: {}", filename, e),
            }
        }
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<(), RemoteError> {
        let client = self.ctx.create_client()?;
        self.delete_file(&client, &format!("sessions/{}.json", id))
            .await?;

        for (filename, _) in self.ctx.list_files(&client, "designs").await? {
            if filename.starts_with(&format!("{}_design.", id)) {
                self.delete_file(&client, &format!("designs/{}", filename))
                    .await?;
            }
        }

        if self.get_active_session().await?.as_deref() == Some(id) {
            self.set_active_session(None).await?;
        }
        Ok(())
    }

    async fn get_active_session(&self) -> Result<Option<String>, RemoteError> {
        let client = self.ctx.create_client()?;
        match self
            .get_json::<ActiveSessionDoc>(&client, "active-session.json")
            .await
        {
            Ok(doc) => Ok(doc.active_session_id.filter(|id| !id.is_empty())),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_active_session(&self, id: Option<&str>) -> Result<(), RemoteError> {
        let client = self.ctx.create_client()?;
        let doc = ActiveSessionDoc {
            active_session_id: id.map(str::to_string),
        };
        self.put_json(&client, "active-session.json", &doc).await
    }

    async fn upload_design(
        &self,
        session_id: &str,
        design: &DataUrl,
    ) -> Result<String, RemoteError> {
        ensure_within_limit(design.bytes.len(), self.ctx.config.max_upload_bytes)?;
        let client = self.ctx.create_client()?;
        let relative = format!("designs/{}_design.{}", session_id, design.extension());
        client
            .put(&self.ctx.path(&relative), design.bytes.clone())
            .await
            .map_err(dav_error)?;
        log::info!("Uploaded design for session {}", session_id);
        Ok(relative)
    }

    async fn fetch_design(&self, reference: &str) -> Result<DataUrl, RemoteError> {
        if DataUrl::is_data_url(reference) {
            return DataUrl::parse(reference);
        }
        let client = self.ctx.create_client()?;
        let bytes = self.get_bytes(&client, reference).await?;
        Ok(DataUrl::new(mime_for(reference), bytes))
    }

    async fn upload_photo(
        &self,
        payload: &DataUrl,
        meta: &PhotoUpload,
    ) -> Result<UploadedPhoto, RemoteError> {
        ensure_within_limit(payload.bytes.len(), self.ctx.config.max_upload_bytes)?;
        let client = self.ctx.create_client()?;
        let credential = self.ctx.credential()?;

        let filename = format!("{}.{}", meta.photo_id, payload.extension());
        let relative = format!("photos/{}", filename);
        client
            .put(&self.ctx.path(&relative), payload.bytes.clone())
            .await
            .map_err(dav_error)?;

        let photo_url = format!(
            "{}{}",
            self.ctx.webdav_url(&credential.user.id),
            self.ctx.path(&relative)
        );
        let doc = PhotoMeta {
            id: meta.photo_id.clone(),
            session_id: meta.session_id.clone(),
            photo_url: photo_url.clone(),
            is_strip: meta.is_strip,
            is_collage: meta.is_collage,
            strip_photos: meta.strip_photos.clone(),
            created_at: meta.created_at.clone(),
            checksum: Some(sha256_hex(&payload.bytes)),
        };
        self.put_json(&client, &format!("photos/{}.json", meta.photo_id), &doc)
            .await?;

        log::info!("Uploaded photo {}", filename);
        Ok(UploadedPhoto {
            photo_id: meta.photo_id.clone(),
            photo_url,
        })
    }

    async fn list_photos(&self, session_id: Option<&str>) -> Result<Vec<PhotoMeta>, RemoteError> {
        let client = self.ctx.create_client()?;
        let mut photos: Vec<PhotoMeta> = self
            .photo_metas(&client)
            .await?
            .into_iter()
            .filter(|p| session_id.is_none() || p.session_id.as_deref() == session_id)
            .collect();
        photos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(photos)
    }

    async fn delete_photo(&self, id: &str) -> Result<(), RemoteError> {
        let client = self.ctx.create_client()?;
        for (filename, _) in self.ctx.list_files(&client, "photos").await? {
            if filename.starts_with(&format!("{}.", id)) {
                self.delete_file(&client, &format!("photos/{}", filename))
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_all_photos(&self) -> Result<usize, RemoteError> {
        let client = self.ctx.create_client()?;
        let mut count = 0;
        for (filename, _) in self.ctx.list_files(&client, "photos").await? {
            self.delete_file(&client, &format!("photos/{}", filename))
                .await?;
            if filename.ends_with(".json") {
                count += 1;
            }
        }
        Ok(count)
    }

    fn session_watcher(&self) -> Option<Arc<dyn SessionWatcher>> {
        let watcher: Arc<dyn SessionWatcher> = Arc::new(NextcloudSessionWatcher {
            ctx: self.ctx.clone(),
        });
        Some(watcher)
    }
}

/// Detects session changes from the ETags of `sessions/*.json`
pub struct NextcloudSessionWatcher {
    ctx: Arc<DavContext>,
}

#[async_trait]
impl SessionWatcher for NextcloudSessionWatcher {
    async fn snapshot(&self) -> Result<HashMap<String, String>, RemoteError> {
        let client = self.ctx.create_client()?;
        Ok(self
            .ctx
            .list_files(&client, "sessions")
            .await?
            .into_iter()
            .filter_map(|(filename, etag)| {
                filename
                    .strip_suffix(".json")
                    .map(|id| (id.to_string(), etag))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_extraction() {
        let text = "Decode(StatusMismatched(StatusMismatchedError { response_code: 401, expected_code: 201 }))";
        assert_eq!(status_in(text), Some(401));
        assert_eq!(status_in("Reqwest(connection refused)"), None);
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for("designs/1_design.png"), "image/png");
        assert_eq!(mime_for("photos/1.jpg"), "image/jpeg");
    }

    #[tokio::test]
    async fn test_register_is_unsupported() {
        let backend = NextcloudBackend::new(NextcloudConfig {
            server_url: "https://cloud.example.com".to_string(),
            ..Default::default()
        })
        .unwrap();
        let err = backend.register("a@b.c", "pw", None).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_calls_without_credential_are_unauthorized() {
        let backend = NextcloudBackend::new(NextcloudConfig::default()).unwrap();
        assert!(backend.list_sessions().await.unwrap_err().is_auth());
        assert!(backend.session_watcher().is_some());
    }
}
