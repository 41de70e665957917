use crate::error::RemoteError;
use crate::models::{Credential, PhotoMeta, PhotoUpload, RemoteSession, UploadedPhoto};
use crate::payload::DataUrl;
use async_trait::async_trait;
use booth_store::UserProfile;
use std::collections::HashMap;
use std::sync::Arc;

/// Network operations the sync engine depends on.
///
/// Every backend implements the same contract, so exactly one of them is
/// picked at startup and the engine never asks which one it got. Calls that
/// act on behalf of a user use the credential installed with
/// [`RemoteDataService::set_credential`].
#[async_trait]
pub trait RemoteDataService: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Installs (or clears) the credential used for subsequent calls
    fn set_credential(&self, credential: Option<&Credential>);

    // Identity

    async fn authenticate(&self, email: &str, password: &str) -> Result<Credential, RemoteError>;

    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Credential, RemoteError>;

    /// Checks a stored credential; `Ok(None)` means it is no longer valid
    async fn verify(&self, credential: &Credential) -> Result<Option<UserProfile>, RemoteError>;

    async fn revoke(&self, credential: &Credential) -> Result<(), RemoteError>;

    // Sessions

    /// Upsert keyed by id; never fails because the session already exists
    async fn create_or_update_session(&self, session: &RemoteSession)
        -> Result<String, RemoteError>;

    async fn list_sessions(&self) -> Result<Vec<RemoteSession>, RemoteError>;

    async fn delete_session(&self, id: &str) -> Result<(), RemoteError>;

    async fn get_active_session(&self) -> Result<Option<String>, RemoteError>;

    async fn set_active_session(&self, id: Option<&str>) -> Result<(), RemoteError>;

    // Blobs

    /// Stores a session's design artwork and returns a durable reference
    async fn upload_design(&self, session_id: &str, design: &DataUrl)
        -> Result<String, RemoteError>;

    /// Resolves a design reference back into an embedded payload
    async fn fetch_design(&self, reference: &str) -> Result<DataUrl, RemoteError>;

    async fn upload_photo(
        &self,
        payload: &DataUrl,
        meta: &PhotoUpload,
    ) -> Result<UploadedPhoto, RemoteError>;

    // Photos

    async fn list_photos(&self, session_id: Option<&str>) -> Result<Vec<PhotoMeta>, RemoteError>;

    async fn delete_photo(&self, id: &str) -> Result<(), RemoteError>;

    /// Deletes every photo of the current user, returning how many went away
    async fn delete_all_photos(&self) -> Result<usize, RemoteError>;

    /// Live change feed for sessions, if this backend has one
    fn session_watcher(&self) -> Option<Arc<dyn SessionWatcher>> {
        None
    }
}

/// Source of session change notifications.
///
/// A snapshot maps each remote session id to an opaque version tag; two
/// snapshots are diffed to find added, modified and removed sessions.
#[async_trait]
pub trait SessionWatcher: Send + Sync {
    async fn snapshot(&self) -> Result<HashMap<String, String>, RemoteError>;
}
