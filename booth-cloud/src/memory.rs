//! In-process backend.
//!
//! Behaves like a real server (per-user scoping, upsert semantics, bearer
//! tokens) and adds knobs for simulating outages, expired tokens and slow
//! links. Used by tests and offline demos.

use crate::error::RemoteError;
use crate::models::{Credential, PhotoMeta, PhotoUpload, RemoteSession, UploadedPhoto};
use crate::payload::{ensure_within_limit, sha256_hex, DataUrl, MAX_UPLOAD_BYTES};
use crate::service::{RemoteDataService, SessionWatcher};
use async_trait::async_trait;
use booth_store::{new_id, now_iso, UserProfile};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct UserData {
    sessions: Vec<RemoteSession>,
    session_revisions: HashMap<String, u64>,
    active_session: Option<String>,
    photos: Vec<PhotoMeta>,
    designs: HashMap<String, DataUrl>,
}

#[derive(Default)]
struct MemoryState {
    /// email -> (password, profile)
    accounts: HashMap<String, (String, UserProfile)>,
    /// token -> user id
    tokens: HashMap<String, String>,
    data: HashMap<String, UserData>,
    credential: Option<Credential>,

    offline: bool,
    fail_next: usize,
    fail_with: Option<RemoteError>,
    latency: Option<Duration>,
    calls: HashMap<String, usize>,
    photo_uploads: HashMap<String, usize>,
    revision: u64,
}

/// Backend that keeps everything in memory
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    max_upload_bytes: usize,
    realtime: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            realtime: false,
        }
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    /// Exposes a session watcher, like a document store with change feeds
    pub fn with_realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only happens after a panicking test; keep serving
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---------------------------------------------------------------------
    // Simulation controls
    // ---------------------------------------------------------------------

    /// Creates an account and returns a valid credential for it
    pub fn seed_account(&self, email: &str, password: &str) -> Credential {
        let mut state = self.state();
        let email = email.to_lowercase();
        let user = UserProfile {
            id: new_id(),
            email: email.clone(),
            display_name: None,
        };
        state
            .accounts
            .insert(email, (password.to_string(), user.clone()));
        let token = new_id();
        state.tokens.insert(token.clone(), user.id.clone());
        Credential { token, user }
    }

    /// Stores a session directly on the server side for `user_id`
    pub fn seed_session(&self, user_id: &str, session: RemoteSession) {
        let mut state = self.state();
        state.revision += 1;
        let revision = state.revision;
        let data = state.data.entry(user_id.to_string()).or_default();
        data.session_revisions.insert(session.id.clone(), revision);
        upsert(&mut data.sessions, session, |s| &s.id);
    }

    pub fn seed_photo(&self, user_id: &str, photo: PhotoMeta) {
        let mut state = self.state();
        let data = state.data.entry(user_id.to_string()).or_default();
        upsert(&mut data.photos, photo, |p| &p.id);
    }

    /// Removes a session server side, as another device would
    pub fn remove_session(&self, user_id: &str, id: &str) {
        let mut state = self.state();
        if let Some(data) = state.data.get_mut(user_id) {
            data.sessions.retain(|s| s.id != id);
            data.session_revisions.remove(id);
        }
    }

    /// Simulates losing (or regaining) connectivity
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Makes the next `count` calls fail with `error`
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        let mut state = self.state();
        state.fail_next = count;
        state.fail_with = Some(error);
    }

    /// Invalidates every issued token, as if they had expired
    pub fn expire_tokens(&self) {
        self.state().tokens.clear();
    }

    /// Delays every call, to observe in-flight behavior
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// How often `operation` was called, including failed attempts
    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    /// How often an upload was attempted for `photo_id`
    pub fn upload_attempts(&self, photo_id: &str) -> usize {
        self.state().photo_uploads.get(photo_id).copied().unwrap_or(0)
    }

    pub fn sessions_of(&self, user_id: &str) -> Vec<RemoteSession> {
        self.state()
            .data
            .get(user_id)
            .map(|d| d.sessions.clone())
            .unwrap_or_default()
    }

    pub fn photos_of(&self, user_id: &str) -> Vec<PhotoMeta> {
        self.state()
            .data
            .get(user_id)
            .map(|d| d.photos.clone())
            .unwrap_or_default()
    }

    pub fn active_session_of(&self, user_id: &str) -> Option<String> {
        self.state()
            .data
            .get(user_id)
            .and_then(|d| d.active_session.clone())
    }

    // ---------------------------------------------------------------------
    // Request plumbing
    // ---------------------------------------------------------------------

    /// Records the call and applies simulated latency and failures
    async fn begin(&self, operation: &str) -> Result<(), RemoteError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(operation.to_string()).or_insert(0) += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if state.offline {
            return Err(RemoteError::Network("Simulated offline".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            let error = state
                .fail_with
                .clone()
                .unwrap_or_else(|| RemoteError::Network("Simulated failure".to_string()));
            return Err(error);
        }
        Ok(())
    }

    /// Resolves the installed credential to a user id
    fn current_user(state: &MemoryState) -> Result<String, RemoteError> {
        let credential = state
            .credential
            .as_ref()
            .ok_or_else(|| RemoteError::Unauthorized("Unauthorized - no token".to_string()))?;
        state
            .tokens
            .get(&credential.token)
            .cloned()
            .ok_or_else(|| RemoteError::Unauthorized("Unauthorized - invalid token".to_string()))
    }

    fn issue_token(state: &mut MemoryState, user: &UserProfile) -> Credential {
        let token = new_id();
        state.tokens.insert(token.clone(), user.id.clone());
        Credential {
            token,
            user: user.clone(),
        }
    }
}

fn upsert<T, F>(items: &mut Vec<T>, item: T, key: F)
where
    F: Fn(&T) -> &String,
{
    match items.iter_mut().find(|existing| key(existing) == key(&item)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[async_trait]
impl RemoteDataService for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set_credential(&self, credential: Option<&Credential>) {
        self.state().credential = credential.cloned();
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<Credential, RemoteError> {
        self.begin("authenticate").await?;
        let mut state = self.state();
        let user = match state.accounts.get(&email.to_lowercase()) {
            Some((stored, user)) if stored == password => user.clone(),
            _ => {
                return Err(RemoteError::Unauthorized(
                    "Invalid email or password".to_string(),
                ))
            }
        };
        Ok(Self::issue_token(&mut state, &user))
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Credential, RemoteError> {
        self.begin("register").await?;
        if password.len() < 6 {
            return Err(RemoteError::BadRequest(
                "Password must be at least 6 characters".to_string(),
            ));
        }
        let email = email.to_lowercase();
        let mut state = self.state();
        if state.accounts.contains_key(&email) {
            return Err(RemoteError::BadRequest("Email already registered".to_string()));
        }
        let user = UserProfile {
            id: new_id(),
            email: email.clone(),
            display_name: display_name.map(str::to_string),
        };
        state
            .accounts
            .insert(email, (password.to_string(), user.clone()));
        Ok(Self::issue_token(&mut state, &user))
    }

    async fn verify(&self, credential: &Credential) -> Result<Option<UserProfile>, RemoteError> {
        self.begin("verify").await?;
        let state = self.state();
        let Some(user_id) = state.tokens.get(&credential.token) else {
            return Ok(None);
        };
        Ok(state
            .accounts
            .values()
            .find(|(_, user)| &user.id == user_id)
            .map(|(_, user)| user.clone()))
    }

    async fn revoke(&self, credential: &Credential) -> Result<(), RemoteError> {
        self.begin("revoke").await?;
        self.state().tokens.remove(&credential.token);
        Ok(())
    }

    async fn create_or_update_session(
        &self,
        session: &RemoteSession,
    ) -> Result<String, RemoteError> {
        self.begin("create_or_update_session").await?;
        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        state.revision += 1;
        let revision = state.revision;

        let mut stored = session.clone();
        if stored.created_at.is_none() {
            stored.created_at = Some(now_iso());
        }
        if stored.updated_at.is_none() {
            stored.updated_at = stored.created_at.clone();
        }

        let data = state.data.entry(user_id).or_default();
        data.session_revisions.insert(stored.id.clone(), revision);
        upsert(&mut data.sessions, stored, |s| &s.id);
        Ok(session.id.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<RemoteSession>, RemoteError> {
        self.begin("list_sessions").await?;
        let state = self.state();
        let user_id = Self::current_user(&state)?;
        Ok(state
            .data
            .get(&user_id)
            .map(|d| d.sessions.clone())
            .unwrap_or_default())
    }

    async fn delete_session(&self, id: &str) -> Result<(), RemoteError> {
        self.begin("delete_session").await?;
        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        let data = state.data.entry(user_id).or_default();
        data.sessions.retain(|s| s.id != id);
        data.session_revisions.remove(id);
        if data.active_session.as_deref() == Some(id) {
            data.active_session = None;
        }
        Ok(())
    }

    async fn get_active_session(&self) -> Result<Option<String>, RemoteError> {
        self.begin("get_active_session").await?;
        let state = self.state();
        let user_id = Self::current_user(&state)?;
        Ok(state
            .data
            .get(&user_id)
            .and_then(|d| d.active_session.clone()))
    }

    async fn set_active_session(&self, id: Option<&str>) -> Result<(), RemoteError> {
        self.begin("set_active_session").await?;
        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        let data = state.data.entry(user_id).or_default();
        if let Some(id) = id {
            if !data.sessions.iter().any(|s| s.id == id) {
                return Err(RemoteError::NotFound(
                    "Session not found or does not belong to you".to_string(),
                ));
            }
        }
        data.active_session = id.map(str::to_string);
        Ok(())
    }

    async fn upload_design(
        &self,
        session_id: &str,
        design: &DataUrl,
    ) -> Result<String, RemoteError> {
        self.begin("upload_design").await?;
        ensure_within_limit(design.bytes.len(), self.max_upload_bytes)?;
        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        let url = format!("memory://{}/designs/{}_design.{}", user_id, session_id, design.extension());
        state
            .data
            .entry(user_id)
            .or_default()
            .designs
            .insert(url.clone(), design.clone());
        Ok(url)
    }

    async fn fetch_design(&self, reference: &str) -> Result<DataUrl, RemoteError> {
        self.begin("fetch_design").await?;
        if DataUrl::is_data_url(reference) {
            return DataUrl::parse(reference);
        }
        let state = self.state();
        let user_id = Self::current_user(&state)?;
        state
            .data
            .get(&user_id)
            .and_then(|d| d.designs.get(reference).cloned())
            .ok_or_else(|| RemoteError::NotFound(format!("Design {}", reference)))
    }

    async fn upload_photo(
        &self,
        payload: &DataUrl,
        meta: &PhotoUpload,
    ) -> Result<UploadedPhoto, RemoteError> {
        *self
            .state()
            .photo_uploads
            .entry(meta.photo_id.clone())
            .or_insert(0) += 1;
        self.begin("upload_photo").await?;
        ensure_within_limit(payload.bytes.len(), self.max_upload_bytes)?;

        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        let photo_url = format!(
            "memory://{}/photos/{}.{}",
            user_id,
            meta.photo_id,
            payload.extension()
        );
        let photo = PhotoMeta {
            id: meta.photo_id.clone(),
            session_id: meta.session_id.clone(),
            photo_url: photo_url.clone(),
            is_strip: meta.is_strip,
            is_collage: meta.is_collage,
            strip_photos: meta.strip_photos.clone(),
            created_at: meta.created_at.clone(),
            checksum: Some(sha256_hex(&payload.bytes)),
        };
        let data = state.data.entry(user_id).or_default();
        upsert(&mut data.photos, photo, |p| &p.id);

        Ok(UploadedPhoto {
            photo_id: meta.photo_id.clone(),
            photo_url,
        })
    }

    async fn list_photos(&self, session_id: Option<&str>) -> Result<Vec<PhotoMeta>, RemoteError> {
        self.begin("list_photos").await?;
        let state = self.state();
        let user_id = Self::current_user(&state)?;
        let mut photos: Vec<PhotoMeta> = state
            .data
            .get(&user_id)
            .map(|d| d.photos.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|p| session_id.is_none() || p.session_id.as_deref() == session_id)
            .collect();
        photos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(photos)
    }

    async fn delete_photo(&self, id: &str) -> Result<(), RemoteError> {
        self.begin("delete_photo").await?;
        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        state
            .data
            .entry(user_id)
            .or_default()
            .photos
            .retain(|p| p.id != id);
        Ok(())
    }

    async fn delete_all_photos(&self) -> Result<usize, RemoteError> {
        self.begin("delete_all_photos").await?;
        let mut state = self.state();
        let user_id = Self::current_user(&state)?;
        let data = state.data.entry(user_id).or_default();
        let count = data.photos.len();
        data.photos.clear();
        Ok(count)
    }

    fn session_watcher(&self) -> Option<Arc<dyn SessionWatcher>> {
        if self.realtime {
            let watcher: Arc<dyn SessionWatcher> = Arc::new(self.clone());
            Some(watcher)
        } else {
            None
        }
    }
}

#[async_trait]
impl SessionWatcher for MemoryBackend {
    async fn snapshot(&self) -> Result<HashMap<String, String>, RemoteError> {
        self.begin("snapshot").await?;
        let state = self.state();
        let user_id = Self::current_user(&state)?;
        Ok(state
            .data
            .get(&user_id)
            .map(|d| {
                d.session_revisions
                    .iter()
                    .map(|(id, rev)| (id.clone(), rev.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(id: &str) -> RemoteSession {
        RemoteSession {
            id: id.to_string(),
            name: format!("Session {}", id),
            design_url: None,
            settings: json!({}),
            created_at: Some("2024-01-01T00:00:00.000Z".to_string()),
            updated_at: Some("2024-01-01T00:00:00.000Z".to_string()),
        }
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let backend = MemoryBackend::new();
        let created = backend.register("A@b.c", "secret1", Some("Ann")).await.unwrap();
        assert_eq!(created.user.email, "a@b.c");

        let again = backend.register("a@b.c", "secret1", None).await;
        assert!(matches!(again, Err(RemoteError::BadRequest(_))));

        let login = backend.authenticate("a@b.c", "secret1").await.unwrap();
        assert_eq!(login.user.id, created.user.id);
        assert!(backend.authenticate("a@b.c", "wrong").await.unwrap_err().is_auth());

        assert!(backend.verify(&login).await.unwrap().is_some());
        backend.revoke(&login).await.unwrap();
        assert!(backend.verify(&login).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_upsert_is_idempotent() {
        let backend = MemoryBackend::new();
        let credential = backend.seed_account("a@b.c", "pw");
        backend.set_credential(Some(&credential));

        let s = session("s1");
        backend.create_or_update_session(&s).await.unwrap();
        backend.create_or_update_session(&s).await.unwrap();

        let sessions = backend.list_sessions().await.unwrap();
        assert_eq!(sessions, vec![s]);
    }

    #[tokio::test]
    async fn test_calls_require_credential() {
        let backend = MemoryBackend::new();
        let err = backend.list_sessions().await.unwrap_err();
        assert!(err.is_auth());

        let credential = backend.seed_account("a@b.c", "pw");
        backend.set_credential(Some(&credential));
        backend.expire_tokens();
        assert!(backend.list_sessions().await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = MemoryBackend::new();
        let credential = backend.seed_account("a@b.c", "pw");
        backend.set_credential(Some(&credential));

        backend.fail_next(1, RemoteError::Server { status: 503, message: "busy".into() });
        assert!(backend.list_sessions().await.is_err());
        assert!(backend.list_sessions().await.is_ok());

        backend.set_offline(true);
        assert!(matches!(
            backend.list_photos(None).await,
            Err(RemoteError::Network(_))
        ));
        assert_eq!(backend.calls("list_sessions"), 2);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let backend = MemoryBackend::new().with_max_upload_bytes(4);
        let credential = backend.seed_account("a@b.c", "pw");
        backend.set_credential(Some(&credential));

        let meta = PhotoUpload {
            photo_id: "p1".to_string(),
            session_id: None,
            is_strip: false,
            is_collage: false,
            strip_photos: None,
            created_at: now_iso(),
        };
        let err = backend
            .upload_photo(&DataUrl::new("image/jpeg", vec![0; 5]), &meta)
            .await
            .unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(backend.upload_attempts("p1"), 1);
    }

    #[tokio::test]
    async fn test_active_session_must_exist() {
        let backend = MemoryBackend::new();
        let credential = backend.seed_account("a@b.c", "pw");
        backend.set_credential(Some(&credential));

        assert!(backend.set_active_session(Some("nope")).await.is_err());
        backend.seed_session(&credential.user.id, session("s1"));
        backend.set_active_session(Some("s1")).await.unwrap();
        assert_eq!(backend.get_active_session().await.unwrap().as_deref(), Some("s1"));

        backend.delete_session("s1").await.unwrap();
        assert_eq!(backend.get_active_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_changes_on_update() {
        let backend = MemoryBackend::new().with_realtime();
        let credential = backend.seed_account("a@b.c", "pw");
        backend.set_credential(Some(&credential));
        let watcher = backend.session_watcher().unwrap();

        backend.create_or_update_session(&session("s1")).await.unwrap();
        let first = watcher.snapshot().await.unwrap();
        backend.create_or_update_session(&session("s1")).await.unwrap();
        let second = watcher.snapshot().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_ne!(first.get("s1"), second.get("s1"));
    }
}
