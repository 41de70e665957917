//! The sync orchestrator: keeps the local store and the remote data service
//! eventually consistent.
//!
//! Everything is written locally first. Pushes queue their item before they
//! touch the network, and take it out of the queue again once the cloud has
//! confirmed it. Remote failures never reach the caller of a push; they turn
//! into queue entries, status changes and events.

use crate::auth::AuthSession;
use crate::config::SyncOptions;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent, SyncStatus};
use crate::merge::{self, CloudSnapshot, MergeStrategy};
use crate::queue::{DrainAction, DrainReport, OfflineQueue};
use crate::realtime::{self, RealtimeHandle};
use booth_cloud::payload::ensure_within_limit;
use booth_cloud::{
    compress, Credential, DataUrl, PhotoUpload, RemoteDataService, RemoteError, RemoteSession,
};
use booth_store::{
    now_iso, LocalStore, Photo, QueueEntry, QueueItem, QueueKind, Session, SessionSettings,
    StoreError, UserProfile,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Result of a push. `Queued` is not an error: the item waits for the next drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Synced,
    Queued,
    /// Can never be synced as is (too large, rejected as malformed)
    Rejected(String),
    /// Neither delivered nor queued; the item only exists locally until it
    /// is pushed again
    Unqueued(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// Nothing to reconcile; `sessions` is the size of the local session list
    Ready { sessions: usize },
    /// This device has data; ask the user for a [`MergeStrategy`]
    MergeRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub strategy: MergeStrategy,
    pub sessions: usize,
    pub sessions_pushed: usize,
    pub photos_queued: usize,
    pub drain: Option<DrainReport>,
}

enum Failure {
    Auth,
    Terminal(String),
    Transient,
}

/// Counts a running push or drain for as long as it lives
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteDataService>,
    auth: AuthSession,
    queue: OfflineQueue,
    events: Arc<EventBus>,
    options: SyncOptions,
    online: AtomicBool,
    in_flight: AtomicUsize,
    realtime: Mutex<Option<RealtimeHandle>>,
    scheduled: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteDataService>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let auth = AuthSession::new(store.clone(), remote.clone())?;
        let queue = OfflineQueue::new(store.clone());

        Ok(Self {
            store,
            remote,
            auth,
            queue,
            events: Arc::new(EventBus::new()),
            options,
            online: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            realtime: Mutex::new(None),
            scheduled: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.events.watch_status()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.auth.user()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> Result<usize, SyncError> {
        Ok(self.queue.len()?)
    }

    pub fn queued_entries(&self) -> Result<Vec<QueueEntry>, SyncError> {
        Ok(self.queue.entries()?)
    }

    pub fn last_sync(&self) -> Result<Option<String>, SyncError> {
        Ok(self.store.last_sync()?)
    }

    /// Current status: `syncing` while work is in flight, `offline` without
    /// connectivity, `pending` while items are queued (or `partial` if the
    /// last drain left them there), else the last published one.
    pub fn status(&self) -> SyncStatus {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return SyncStatus::Syncing;
        }
        if !self.is_online() {
            return SyncStatus::Offline;
        }
        let published = self.events.status();
        match self.queue.is_empty() {
            Ok(false) if published == SyncStatus::Partial => SyncStatus::Partial,
            Ok(false) => SyncStatus::Pending,
            _ => published,
        }
    }

    fn ready(&self) -> bool {
        self.is_online() && self.auth.is_authenticated()
    }

    fn begin_sync(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.events.set_status(SyncStatus::Syncing);
        InFlight(&self.in_flight)
    }

    /// Status after an item was queued without an attempt
    fn queued_status(&self) -> SyncStatus {
        if self.is_online() {
            SyncStatus::Pending
        } else {
            SyncStatus::Offline
        }
    }

    /// Status after a successful push
    fn settled_status(&self) -> SyncStatus {
        match self.queue.is_empty() {
            Ok(true) => SyncStatus::Synced,
            Ok(false) => SyncStatus::Pending,
            Err(_) => SyncStatus::Error,
        }
    }

    fn record_sync(&self) {
        if let Err(e) = self.store.set_last_sync(&now_iso()) {
            log::warn!("Could not record last sync time: {}", e);
        }
    }

    fn classify(&self, error: &RemoteError) -> Failure {
        if error.is_auth() {
            self.handle_unauthorized();
            Failure::Auth
        } else if error.is_terminal() {
            Failure::Terminal(error.to_string())
        } else {
            Failure::Transient
        }
    }

    /// Wraps a remote error for callers that need to see it
    fn remote_failure(&self, error: RemoteError) -> SyncError {
        if error.is_auth() {
            self.handle_unauthorized();
        }
        SyncError::Remote(error)
    }

    /// The server no longer accepts our credential: forget it, keep all data
    fn handle_unauthorized(&self) {
        if !self.auth.is_authenticated() {
            return;
        }
        log::warn!(
            "Credential rejected by the {} backend, sign-in required",
            self.remote.name()
        );
        if let Err(e) = self.auth.clear() {
            log::error!("Failed to clear stored credential: {}", e);
        }
        self.stop_realtime_sync();
        self.events.emit(SyncEvent::ReauthRequired);
        self.events.emit(SyncEvent::IdentityChanged(None));
    }

    fn emit_queued(&self, kind: QueueKind, id: &str) {
        let id = id.to_string();
        self.events.emit(match kind {
            QueueKind::Photo => SyncEvent::PhotoQueued { photo_id: id },
            QueueKind::Session => SyncEvent::SessionQueued { session_id: id },
        });
    }

    fn emit_rejected(&self, kind: QueueKind, id: &str, reason: &str) {
        let (id, reason) = (id.to_string(), reason.to_string());
        self.events.emit(match kind {
            QueueKind::Photo => SyncEvent::PhotoRejected {
                photo_id: id,
                reason,
            },
            QueueKind::Session => SyncEvent::SessionRejected {
                session_id: id,
                reason,
            },
        });
    }

    // ---------------------------------------------------------------------
    // Pushing
    // ---------------------------------------------------------------------

    /// Uploads a session (design first, then the document). Never fails; on
    /// any failure the session stays queued.
    pub async fn push_session(&self, session: &Session) -> PushOutcome {
        self.push(QueueItem::Session(session.clone())).await
    }

    /// Compresses and uploads a photo. Never fails; on any failure the photo
    /// stays queued.
    pub async fn push_photo(&self, photo: &Photo) -> PushOutcome {
        self.push(QueueItem::Photo(photo.clone())).await
    }

    async fn push(&self, item: QueueItem) -> PushOutcome {
        let kind = item.kind();
        let id = item.id().to_string();

        let (entry, queue_error) = match self.queue.enqueue(item.clone()) {
            Ok(entry) => (Some(entry), None),
            Err(e) => {
                log::error!("Could not queue {} {}: {}", kind, id, e);
                (None, Some(e.to_string()))
            }
        };

        if !self.ready() {
            if let Some(reason) = &queue_error {
                self.events.set_status(SyncStatus::Error);
                return PushOutcome::Unqueued(reason.clone());
            }
            log::debug!("Not pushing {} {} now, left queued", kind, id);
            self.emit_queued(kind, &id);
            self.events.set_status(self.queued_status());
            return PushOutcome::Queued;
        }

        let _in_flight = self.begin_sync();
        let error = match self.attempt(&item).await {
            Ok(()) => {
                if let Some(entry) = &entry {
                    if let Err(e) = self.queue.remove_if_unchanged(entry) {
                        log::warn!("Could not unqueue {} {}: {}", kind, id, e);
                    }
                }
                self.events.set_status(self.settled_status());
                return PushOutcome::Synced;
            }
            Err(error) => error,
        };

        match self.classify(&error) {
            Failure::Terminal(reason) => {
                log::warn!("{} {} rejected, not retrying: {}", kind, id, reason);
                if let Some(entry) = &entry {
                    if let Err(e) = self.queue.remove_if_unchanged(entry) {
                        log::warn!("Could not unqueue {} {}: {}", kind, id, e);
                    }
                }
                self.emit_rejected(kind, &id, &reason);
                self.events.set_status(SyncStatus::Error);
                PushOutcome::Rejected(reason)
            }
            Failure::Auth | Failure::Transient => {
                if let Some(reason) = &queue_error {
                    log::warn!("Push of {} {} failed and it could not be queued: {}", kind, id, error);
                    self.events.set_status(SyncStatus::Error);
                    return PushOutcome::Unqueued(reason.clone());
                }
                log::warn!("Push of {} {} failed, left queued: {}", kind, id, error);
                self.emit_queued(kind, &id);
                self.events.set_status(SyncStatus::Error);
                PushOutcome::Queued
            }
        }
    }

    async fn attempt(&self, item: &QueueItem) -> Result<(), RemoteError> {
        match item {
            QueueItem::Photo(photo) => self.upload_photo(photo).await,
            QueueItem::Session(session) => self.upload_session(session).await,
        }
    }

    async fn upload_session(&self, session: &Session) -> Result<(), RemoteError> {
        let design_url = match session.design.as_deref() {
            Some(design) if DataUrl::is_data_url(design) => {
                let payload = DataUrl::parse(design)?;
                ensure_within_limit(payload.bytes.len(), self.options.max_upload_bytes)?;
                Some(self.remote.upload_design(&session.id, &payload).await?)
            }
            Some(reference) if !reference.is_empty() => Some(reference.to_string()),
            _ => None,
        };

        let remote = RemoteSession {
            id: session.id.clone(),
            name: session.name.clone(),
            design_url,
            settings: serde_json::to_value(&session.settings)?,
            created_at: session.created_at.clone(),
            updated_at: session.updated_at.clone(),
        };
        self.remote.create_or_update_session(&remote).await?;

        log::info!("Session {} synced to {}", session.id, self.remote.name());
        self.events.emit(SyncEvent::SessionSynced {
            session_id: session.id.clone(),
        });
        self.record_sync();
        Ok(())
    }

    async fn upload_photo(&self, photo: &Photo) -> Result<(), RemoteError> {
        let data = photo.data.as_deref().ok_or_else(|| {
            RemoteError::BadRequest(format!("Photo {} has no image data", photo.id))
        })?;
        let payload = compress(DataUrl::parse(data)?, self.options.compress_options()).await;
        ensure_within_limit(payload.bytes.len(), self.options.max_upload_bytes)?;

        let uploaded = self
            .remote
            .upload_photo(&payload, &PhotoUpload::from(photo))
            .await?;
        log::info!(
            "Photo {} uploaded ({} bytes)",
            photo.id,
            payload.bytes.len()
        );

        let cloud_url = uploaded.photo_url;
        match self.store.update_photo(&photo.id, |stored| {
            stored.uploaded_to_cloud = true;
            stored.cloud_url = Some(cloud_url.clone());
        }) {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                log::debug!("Photo {} was deleted locally during upload", photo.id)
            }
            Err(e) => log::warn!("Could not mark photo {} as uploaded: {}", photo.id, e),
        }

        self.events.emit(SyncEvent::PhotoSynced {
            photo_id: photo.id.clone(),
            cloud_url,
        });
        self.record_sync();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Local writes that sync
    // ---------------------------------------------------------------------

    /// Stores a freshly captured photo, then pushes it
    pub async fn capture_photo(&self, photo: Photo) -> Result<PushOutcome, SyncError> {
        self.store.add_photo(&photo)?;
        log::info!("Captured photo {}", photo.id);
        Ok(self.push_photo(&photo).await)
    }

    /// Stores a session as given, then pushes it
    pub async fn save_session(&self, session: Session) -> Result<PushOutcome, SyncError> {
        self.store.upsert_session(&session)?;
        Ok(self.push_session(&session).await)
    }

    pub async fn create_session(
        &self,
        name: Option<&str>,
        settings: Option<&Value>,
    ) -> Result<(Session, PushOutcome), SyncError> {
        let session = self.store.create_session(name, None, settings)?;
        let outcome = self.push_session(&session).await;
        Ok((session, outcome))
    }

    /// Deep-merges `overrides` into a session's settings and schedules a push
    pub fn update_session_settings(
        self: &Arc<Self>,
        id: &str,
        overrides: &Value,
    ) -> Result<Session, SyncError> {
        let current = self
            .store
            .get_session(id)?
            .ok_or_else(|| StoreError::NotFound(format!("Session {}", id)))?;
        let settings = current
            .settings
            .merged_with(overrides)
            .map_err(|e| SyncError::Other(format!("Invalid settings: {}", e)))?;

        let session = self.store.update_session(id, |s| s.settings = settings)?;
        self.schedule_session_push(&session);
        Ok(session)
    }

    /// Replaces a session's design artwork and schedules a push
    pub fn set_session_design(
        self: &Arc<Self>,
        id: &str,
        design: Option<String>,
    ) -> Result<Session, SyncError> {
        let session = self.store.update_session(id, |s| s.design = design)?;
        self.schedule_session_push(&session);
        Ok(session)
    }

    /// Queues the session now and pushes its latest stored version once no
    /// further change arrived for the debounce delay.
    ///
    /// The delayed push runs on the current Tokio runtime. Called outside of
    /// one, the session is only queued and waits for the next drain.
    pub fn schedule_session_push(self: &Arc<Self>, session: &Session) {
        if let Err(e) = self.queue.enqueue_session(session.clone()) {
            log::error!("Could not queue session {}: {}", session.id, e);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime, session {} left queued", session.id);
            return;
        };

        let delay = Duration::from_millis(self.options.session_push_debounce_ms);
        let weak = Arc::downgrade(self);
        let id = session.id.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            match this.store.get_session(&id) {
                Ok(Some(latest)) => {
                    this.push_session(&latest).await;
                }
                Ok(None) => log::debug!("Session {} deleted before its push", id),
                Err(e) => log::warn!("Could not load session {} for push: {}", id, e),
            }
        });

        if let Some(previous) = lock(&self.scheduled).insert(session.id.clone(), task) {
            previous.abort();
        }
    }

    fn cancel_scheduled_push(&self, id: &str) {
        if let Some(task) = lock(&self.scheduled).remove(id) {
            task.abort();
        }
    }

    fn cancel_scheduled_pushes(&self) {
        for (_, task) in lock(&self.scheduled).drain() {
            task.abort();
        }
    }

    // ---------------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------------

    /// Runs one pass over the offline queue.
    ///
    /// Returns `None` when not signed in, offline, or another pass is running.
    pub async fn drain_queue(&self) -> Option<DrainReport> {
        if !self.auth.is_authenticated() {
            log::debug!("Not draining queue: not authenticated");
            return None;
        }
        if !self.is_online() {
            log::debug!("Not draining queue: offline");
            return None;
        }
        if let Ok(true) = self.queue.is_empty() {
            self.events.set_status(SyncStatus::Synced);
            return Some(DrainReport::default());
        }

        let _in_flight = self.begin_sync();
        match self.queue.drain_with(move |entry| self.replay(entry)).await {
            Ok(Some(report)) => {
                let status = if report.halted {
                    SyncStatus::Error
                } else if report.remaining > 0 {
                    SyncStatus::Partial
                } else {
                    SyncStatus::Synced
                };
                self.events.set_status(status);
                Some(report)
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("Queue drain failed: {}", e);
                self.events.set_status(SyncStatus::Error);
                None
            }
        }
    }

    async fn replay(&self, entry: QueueEntry) -> DrainAction {
        if !self.auth.is_authenticated() {
            return DrainAction::Halt;
        }
        let kind = entry.kind();
        let id = entry.id().to_string();

        let error = match self.attempt(&entry.item).await {
            Ok(()) => return DrainAction::Done,
            Err(error) => error,
        };

        match self.classify(&error) {
            Failure::Auth => DrainAction::Halt,
            Failure::Terminal(reason) => {
                log::warn!("Dropping queued {} {}: {}", kind, id, reason);
                self.emit_rejected(kind, &id, &reason);
                DrainAction::Drop
            }
            Failure::Transient => {
                log::debug!("Queued {} {} still failing: {}", kind, id, error);
                DrainAction::Retain
            }
        }
    }

    /// Connectivity changed; regaining it drains the queue
    pub async fn set_online(&self, online: bool) -> Option<DrainReport> {
        let was_online = self.online.swap(online, Ordering::SeqCst);

        if !online {
            if was_online {
                log::info!("Connection lost, working offline");
            }
            self.events.set_status(SyncStatus::Offline);
            return None;
        }

        if !was_online {
            log::info!("Connection restored");
        }
        if self.auth.is_authenticated() {
            self.drain_queue().await
        } else {
            let status = match self.queue.is_empty() {
                Ok(false) => SyncStatus::Pending,
                _ => SyncStatus::Idle,
            };
            self.events.set_status(status);
            None
        }
    }

    // ---------------------------------------------------------------------
    // Pulling
    // ---------------------------------------------------------------------

    /// All sessions of the signed-in user, designs resolved to data URLs.
    /// Does not touch the local store.
    pub async fn pull_sessions(&self) -> Result<Vec<Session>, SyncError> {
        if !self.auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        let remote_sessions = self
            .remote
            .list_sessions()
            .await
            .map_err(|e| self.remote_failure(e))?;

        let mut sessions = Vec::with_capacity(remote_sessions.len());
        for remote in remote_sessions {
            sessions.push(self.resolve_session(remote).await);
        }
        log::info!("Pulled {} sessions from {}", sessions.len(), self.remote.name());
        Ok(sessions)
    }

    async fn resolve_session(&self, remote: RemoteSession) -> Session {
        let design = match remote.design_url.as_deref() {
            Some(reference) if !reference.is_empty() => {
                match self.remote.fetch_design(reference).await {
                    Ok(payload) => Some(payload.to_string()),
                    Err(e) => {
                        log::warn!("Could not fetch design of session {}: {}", remote.id, e);
                        Some(reference.to_string())
                    }
                }
            }
            _ => None,
        };

        let settings = SessionSettings::from_partial(&remote.settings).unwrap_or_else(|e| {
            log::warn!("Session {} has unreadable settings: {}", remote.id, e);
            SessionSettings::default()
        });

        Session {
            id: remote.id,
            name: remote.name,
            design,
            settings,
            created_at: remote.created_at,
            updated_at: remote.updated_at,
        }
    }

    /// Remote photo metadata, newest first. Images are not downloaded.
    pub async fn pull_photos(&self, session_id: Option<&str>) -> Result<Vec<Photo>, SyncError> {
        if !self.auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        let mut metas = self
            .remote
            .list_photos(session_id)
            .await
            .map_err(|e| self.remote_failure(e))?;
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        log::info!("Pulled {} photos from {}", metas.len(), self.remote.name());
        Ok(metas.into_iter().map(Photo::from).collect())
    }

    // ---------------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------------

    /// Verifies the cached credential on startup and drains if it holds
    pub async fn restore(&self) -> Result<Option<UserProfile>, SyncError> {
        let had_credential = self.auth.is_authenticated();
        let user = self.auth.restore().await?;

        match &user {
            Some(user) => self
                .events
                .emit(SyncEvent::IdentityChanged(Some(user.clone()))),
            None if had_credential => {
                self.events.emit(SyncEvent::ReauthRequired);
                self.events.emit(SyncEvent::IdentityChanged(None));
            }
            None => {}
        }

        if user.is_some() {
            self.drain_queue().await;
        }
        Ok(user)
    }

    pub async fn sign_in(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<SignInOutcome, SyncError> {
        let user = self.auth.sign_in(email, password).await?;
        self.events.emit(SyncEvent::IdentityChanged(Some(user)));
        self.after_sign_in().await
    }

    /// Signs in with a credential obtained out of band (e.g. a login flow)
    pub async fn adopt_credential(
        self: &Arc<Self>,
        credential: Credential,
    ) -> Result<SignInOutcome, SyncError> {
        let user = self.auth.adopt(credential)?;
        self.events.emit(SyncEvent::IdentityChanged(Some(user)));
        self.after_sign_in().await
    }

    /// With an empty device the cloud data is adopted as is; otherwise the
    /// user has to pick a merge strategy. Either way the queue is drained and
    /// realtime sync started.
    async fn after_sign_in(self: &Arc<Self>) -> Result<SignInOutcome, SyncError> {
        let outcome = if self.store.has_local_data()? {
            log::info!("Local data present, waiting for a merge strategy");
            SignInOutcome::MergeRequired
        } else {
            self.adopt_cloud_sessions().await?
        };

        self.drain_queue().await;
        self.setup_realtime_sync();
        Ok(outcome)
    }

    async fn adopt_cloud_sessions(&self) -> Result<SignInOutcome, SyncError> {
        let sessions = {
            let _in_flight = self.begin_sync();
            self.pull_sessions().await?
        };
        self.store.save_sessions(&sessions)?;

        match self.remote.get_active_session().await {
            Ok(Some(id)) if sessions.iter().any(|s| s.id == id) => {
                self.store.set_active_session_id(Some(&id))?;
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not fetch the active session: {}", e),
        }

        log::info!("Adopted {} sessions from the cloud", sessions.len());
        Ok(SignInOutcome::Ready {
            sessions: sessions.len(),
        })
    }

    /// Registers, then pushes every local session to the new account
    pub async fn sign_up(
        self: &Arc<Self>,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<SignInOutcome, SyncError> {
        let user = self.auth.sign_up(email, password, display_name).await?;
        self.events.emit(SyncEvent::IdentityChanged(Some(user)));

        let sessions = self.store.sessions()?;
        for session in &sessions {
            self.push_session(session).await;
        }
        self.drain_queue().await;
        self.setup_realtime_sync();
        Ok(SignInOutcome::Ready {
            sessions: sessions.len(),
        })
    }

    /// Signs out and empties the queue. Local photos and sessions stay.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.stop_realtime_sync();
        self.cancel_scheduled_pushes();
        self.auth.sign_out().await?;
        self.queue.clear()?;

        self.events.emit(SyncEvent::IdentityChanged(None));
        self.events.set_status(SyncStatus::Idle);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Merge
    // ---------------------------------------------------------------------

    /// Reconciles local and cloud data after signing in on a device that
    /// already has data.
    ///
    /// Fails without touching local data when the cloud cannot be read.
    pub async fn merge_local_and_cloud_data(
        &self,
        strategy: MergeStrategy,
    ) -> Result<MergeReport, SyncError> {
        if !self.auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        log::info!("Merging local and cloud data ({})", strategy);

        match self.run_merge(strategy).await {
            Ok(report) => Ok(report),
            Err(e) => {
                log::error!("Merge failed: {}", e);
                self.events.set_status(SyncStatus::Error);
                self.events.emit(SyncEvent::MergeFailed {
                    reason: e.user_message(),
                });
                Err(e)
            }
        }
    }

    async fn run_merge(&self, strategy: MergeStrategy) -> Result<MergeReport, SyncError> {
        let local_sessions = self.store.sessions()?;
        let local_photos = self.store.photos()?;

        let mut cloud = CloudSnapshot::default();
        {
            let _in_flight = self.begin_sync();
            if strategy.needs_cloud_sessions() {
                cloud.sessions = self.pull_sessions().await?;
            }
            if strategy.needs_cloud_photos() {
                cloud.photo_ids = self
                    .pull_photos(None)
                    .await?
                    .into_iter()
                    .map(|p| p.id)
                    .collect();
            }
        }

        let plan = merge::plan(strategy, &local_sessions, &local_photos, &cloud);
        self.store.save_sessions(&plan.sessions)?;
        if let Some(active) = self.store.active_session_id()? {
            if !plan.sessions.iter().any(|s| s.id == active) {
                self.store.set_active_session_id(None)?;
            }
        }

        for photo in &plan.photos_to_queue {
            self.queue.enqueue_photo(photo.clone())?;
            self.emit_queued(QueueKind::Photo, &photo.id);
        }

        let mut sessions_pushed = 0;
        for session in &plan.sessions {
            if self.push_session(session).await == PushOutcome::Synced {
                sessions_pushed += 1;
            }
        }

        let drain = self.drain_queue().await;
        log::info!(
            "Merge ({}) done: {} sessions, {} pushed, {} photos queued",
            strategy,
            plan.sessions.len(),
            sessions_pushed,
            plan.photos_to_queue.len()
        );

        Ok(MergeReport {
            strategy,
            sessions: plan.sessions.len(),
            sessions_pushed,
            photos_queued: plan.photos_to_queue.len(),
            drain,
        })
    }

    // ---------------------------------------------------------------------
    // Deletes and the active pointer
    // ---------------------------------------------------------------------

    /// Removes a photo locally and from the queue; removes it remotely if it
    /// was uploaded. A failed remote delete is only logged.
    pub async fn delete_photo(&self, id: &str) -> Result<bool, SyncError> {
        let removed = self.store.delete_photo(id)?;
        self.queue.remove(QueueKind::Photo, id)?;

        // Photos missing locally may still be cloud-only gallery entries
        let remote_copy = removed.as_ref().map_or(true, |p| p.uploaded_to_cloud);
        if remote_copy && self.ready() {
            if let Err(e) = self.remote.delete_photo(id).await {
                if e.is_auth() {
                    self.handle_unauthorized();
                }
                log::warn!("Remote delete of photo {} failed: {}", id, e);
            }
        }
        Ok(removed.is_some())
    }

    pub async fn delete_all_photos(&self) -> Result<usize, SyncError> {
        let count = self.store.clear_photos()?;
        let unqueued = self.queue.remove_kind(QueueKind::Photo)?;
        log::info!("Deleted {} local photos ({} were queued)", count, unqueued);

        if self.ready() {
            match self.remote.delete_all_photos().await {
                Ok(remote) => log::info!("Deleted {} remote photos", remote),
                Err(e) => {
                    if e.is_auth() {
                        self.handle_unauthorized();
                    }
                    log::warn!("Remote delete of all photos failed: {}", e);
                }
            }
        }
        Ok(count)
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool, SyncError> {
        self.cancel_scheduled_push(id);
        let removed = self.store.delete_session(id)?;
        self.queue.remove(QueueKind::Session, id)?;

        if self.ready() {
            if let Err(e) = self.remote.delete_session(id).await {
                if e.is_auth() {
                    self.handle_unauthorized();
                }
                log::warn!("Remote delete of session {} failed: {}", id, e);
            }
        }
        Ok(removed)
    }

    /// Sets the active pointer locally, then remotely on a best-effort basis
    pub async fn set_active_session(&self, id: Option<&str>) -> Result<(), SyncError> {
        if let Some(id) = id {
            if self.store.get_session(id)?.is_none() {
                return Err(StoreError::NotFound(format!("Session {}", id)).into());
            }
        }
        self.store.set_active_session_id(id)?;

        if self.ready() {
            if let Err(e) = self.remote.set_active_session(id).await {
                if e.is_auth() {
                    self.handle_unauthorized();
                }
                log::warn!("Could not sync the active session: {}", e);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Realtime
    // ---------------------------------------------------------------------

    /// Starts watching remote sessions, if the backend can.
    ///
    /// Returns whether a watcher is running.
    pub fn setup_realtime_sync(self: &Arc<Self>) -> bool {
        if !self.auth.is_authenticated() {
            log::debug!("Realtime sync needs a signed-in user");
            return false;
        }
        let Some(watcher) = self.remote.session_watcher() else {
            log::info!("The {} backend has no realtime channel", self.remote.name());
            return false;
        };

        let weak = Arc::downgrade(self);
        let handle = realtime::spawn_session_watcher(
            watcher,
            self.events.clone(),
            Duration::from_secs(self.options.realtime_poll_secs),
            move || {
                if let Some(this) = weak.upgrade() {
                    this.handle_unauthorized();
                }
            },
        );

        if let Some(previous) = lock(&self.realtime).replace(handle) {
            previous.stop();
        }
        true
    }

    /// Whether a realtime watcher is currently polling
    pub fn is_realtime_active(&self) -> bool {
        lock(&self.realtime)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop_realtime_sync(&self) {
        if let Some(handle) = lock(&self.realtime).take() {
            log::info!("Realtime sync stopped");
            handle.stop();
        }
    }
}
