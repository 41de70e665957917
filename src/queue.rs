//! Offline queue: sync operations waiting for the next chance to reach the cloud.
//!
//! The queue lives in the local store, so it survives restarts. Retries only
//! happen when something drains it (reconnect, sign-in, an explicit drain);
//! there is no timer.

use booth_store::{LocalStore, Photo, QueueEntry, QueueItem, QueueKind, Session, StoreError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// What a drain handler wants done with the entry it was given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainAction {
    /// Synced; remove the entry
    Done,
    /// Failed transiently; keep it for the next pass
    Retain,
    /// Can never succeed; remove it without syncing
    Drop,
    /// Keep it and stop the pass (e.g. the credential was rejected)
    Halt,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retained: usize,
    pub dropped: usize,
    /// Entries still queued after the pass
    pub remaining: usize,
    pub halted: bool,
}

/// Resets the single-flight flag when a pass ends, however it ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OfflineQueue {
    store: Arc<LocalStore>,
    draining: AtomicBool,
    /// Serializes read-modify-write cycles on the stored list
    edit: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            draining: AtomicBool::new(false),
            edit: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.edit.lock().map_err(|_| StoreError::Lock)
    }

    pub fn entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.store.queue()
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.entries()?.is_empty())
    }

    pub fn contains(&self, kind: QueueKind, id: &str) -> Result<bool, StoreError> {
        Ok(self.entries()?.iter().any(|e| e.same_target(kind, id)))
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Queues a photo upload. The first queued copy wins; returns the entry
    /// that is in the queue afterwards.
    pub fn enqueue_photo(&self, photo: Photo) -> Result<QueueEntry, StoreError> {
        let _edit = self.lock()?;
        let mut entries = self.store.queue()?;

        if let Some(existing) = entries
            .iter()
            .find(|e| e.same_target(QueueKind::Photo, &photo.id))
        {
            log::debug!("Photo {} already queued", photo.id);
            return Ok(existing.clone());
        }

        let entry = QueueEntry::new(QueueItem::Photo(photo));
        entries.push(entry.clone());
        self.store.save_queue(&entries)?;
        log::info!("Queued photo {} ({} pending)", entry.id(), entries.len());
        Ok(entry)
    }

    /// Queues a session push, replacing an older snapshot of the same session
    /// in place.
    pub fn enqueue_session(&self, session: Session) -> Result<QueueEntry, StoreError> {
        let _edit = self.lock()?;
        let mut entries = self.store.queue()?;
        let entry = QueueEntry::new(QueueItem::Session(session));

        match entries
            .iter_mut()
            .find(|e| e.same_target(QueueKind::Session, entry.id()))
        {
            Some(existing) => {
                log::debug!("Replacing queued snapshot of session {}", entry.id());
                *existing = entry.clone();
            }
            None => {
                entries.push(entry.clone());
                log::info!("Queued session {} ({} pending)", entry.id(), entries.len());
            }
        }

        self.store.save_queue(&entries)?;
        Ok(entry)
    }

    pub fn enqueue(&self, item: QueueItem) -> Result<QueueEntry, StoreError> {
        match item {
            QueueItem::Photo(photo) => self.enqueue_photo(photo),
            QueueItem::Session(session) => self.enqueue_session(session),
        }
    }

    /// Removes whatever is queued for `(kind, id)`
    pub fn remove(&self, kind: QueueKind, id: &str) -> Result<bool, StoreError> {
        let _edit = self.lock()?;
        let mut entries = self.store.queue()?;
        let before = entries.len();
        entries.retain(|e| !e.same_target(kind, id));
        if entries.len() == before {
            return Ok(false);
        }
        self.store.save_queue(&entries)?;
        log::debug!("Removed queued {} {}", kind, id);
        Ok(true)
    }

    /// Removes `entry` only if the queue still holds exactly that snapshot.
    ///
    /// A newer snapshot queued meanwhile stays for the next pass.
    pub fn remove_if_unchanged(&self, entry: &QueueEntry) -> Result<bool, StoreError> {
        let _edit = self.lock()?;
        let mut entries = self.store.queue()?;
        let Some(position) = entries.iter().position(|e| e == entry) else {
            log::debug!("Queued {} {} changed meanwhile, keeping it", entry.kind(), entry.id());
            return Ok(false);
        };
        entries.remove(position);
        self.store.save_queue(&entries)?;
        Ok(true)
    }

    /// Removes every queued entry of one kind
    pub fn remove_kind(&self, kind: QueueKind) -> Result<usize, StoreError> {
        let _edit = self.lock()?;
        let mut entries = self.store.queue()?;
        let before = entries.len();
        entries.retain(|e| e.kind() != kind);
        let removed = before - entries.len();
        if removed > 0 {
            self.store.save_queue(&entries)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let _edit = self.lock()?;
        self.store.save_queue(&[])?;
        log::info!("Offline queue cleared");
        Ok(())
    }

    /// Runs one pass over a snapshot of the queue, oldest entry first.
    ///
    /// Entries are awaited one after another. Returns `Ok(None)` without doing
    /// anything when another pass is already running. Entries queued while
    /// the pass runs wait for the next one.
    pub async fn drain_with<F, Fut>(&self, mut handler: F) -> Result<Option<DrainReport>, StoreError>
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = DrainAction>,
    {
        if self.draining.swap(true, Ordering::SeqCst) {
            log::debug!("Queue drain already in progress");
            return Ok(None);
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.store.queue()?;
        let mut report = DrainReport::default();
        log::info!("Draining offline queue: {} entries", snapshot.len());

        for entry in snapshot {
            report.attempted += 1;
            match handler(entry.clone()).await {
                DrainAction::Done => {
                    report.succeeded += 1;
                    self.remove_if_unchanged(&entry)?;
                }
                DrainAction::Drop => {
                    report.dropped += 1;
                    self.remove_if_unchanged(&entry)?;
                }
                DrainAction::Retain => report.retained += 1,
                DrainAction::Halt => {
                    report.retained += 1;
                    report.halted = true;
                    break;
                }
            }
        }

        report.remaining = self.len()?;
        log::info!(
            "Drain pass finished: {} synced, {} kept, {} dropped, {} remaining",
            report.succeeded,
            report.retained,
            report.dropped,
            report.remaining
        );
        Ok(Some(report))
    }
}
