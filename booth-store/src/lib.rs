//! # Booth Store
//!
//! Data model and local persistence for the photobooth.
//!
//! This crate provides:
//! - The domain types (sessions with their overlay settings, photos, videos,
//!   offline queue entries, cached user profile)
//! - Default session settings and the deep merge that upgrades older sessions
//! - A key/value [`LocalStore`] on top of SQLite that mirrors the browser
//!   storage layout (one JSON document per key), including quota handling
//!
//! ## Separation of Concerns
//!
//! This crate has no network awareness. Deciding what to push, when to retry
//! and how to reconcile with the cloud is the job of the sync crate.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use booth_store::{LocalStore, StoreConfig};
//!
//! let store = LocalStore::open("./data/photobooth.db", StoreConfig::default())?;
//! let session = store.create_session(Some("Wedding"), None, None)?;
//! store.set_active_session_id(Some(&session.id))?;
//! ```

pub mod models;
pub mod schema;
pub mod settings;
pub mod store;

pub use models::{
    new_id, now_iso, Photo, QueueEntry, QueueItem, QueueKind, Session, UserProfile, Video,
};
pub use schema::init_store_schema;
pub use settings::{
    deep_merge, BackgroundSettings, BorderSettings, CollageLogoSettings, CornerLogoSettings,
    LayoutSettings, SessionSettings, TextSettings,
};
pub use store::{keys, LocalStore, StoreConfig, StoreError};
