//! # Photobooth Sync
//!
//! Local-first sync engine for a photobooth. Captures and session edits land
//! in the [`LocalStore`](booth_store::LocalStore) immediately; the
//! [`SyncOrchestrator`] carries them to whichever remote data service the
//! booth is configured for, queues what cannot be delivered yet, and
//! reconciles local and cloud data on first sign-in.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use photobooth_sync::{BoothConfig, SyncOrchestrator};
//! use std::sync::Arc;
//!
//! let config = BoothConfig::load("photobooth.toml")?;
//! let store = Arc::new(LocalStore::open(&config.storage.path, config.store_config())?);
//! let sync = Arc::new(SyncOrchestrator::new(store, config.build_backend()?, config.sync.clone())?);
//!
//! sync.restore().await?;
//! let outcome = sync.capture_photo(Photo::new(data_url, None)).await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod merge;
pub mod queue;
pub mod realtime;
pub mod sync;

pub use auth::AuthSession;
pub use config::{BackendKind, BoothConfig, SyncOptions};
pub use error::SyncError;
pub use events::{ChangeKind, EventBus, SyncEvent, SyncStatus};
pub use merge::MergeStrategy;
pub use queue::{DrainReport, OfflineQueue};
pub use sync::{MergeReport, PushOutcome, SignInOutcome, SyncOrchestrator};
