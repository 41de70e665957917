//! # Booth Cloud
//!
//! The remote side of photobooth sync: the [`RemoteDataService`] contract the
//! sync engine talks to, and interchangeable backends implementing it.
//!
//! - `http` (feature `http`): self-hosted JSON API with bearer tokens
//! - `nextcloud` (feature `nextcloud`): Nextcloud account, documents over WebDAV,
//!   Login Flow v2 and an ETag based session watcher
//! - [`MemoryBackend`]: in-process server for tests and offline demos
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use booth_cloud::{HttpBackend, HttpBackendConfig, RemoteDataService};
//!
//! let backend = HttpBackend::new(HttpBackendConfig {
//!     base_url: "https://booth.example.com".to_string(),
//!     ..Default::default()
//! })?;
//! let credential = backend.authenticate("me@example.com", "secret").await?;
//! backend.set_credential(Some(&credential));
//! let sessions = backend.list_sessions().await?;
//! ```

pub mod error;
pub mod memory;
pub mod models;
pub mod payload;
pub mod service;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "nextcloud")]
pub mod login_flow;

#[cfg(feature = "nextcloud")]
pub mod nextcloud;

pub use error::RemoteError;
pub use memory::MemoryBackend;
pub use models::{Credential, PhotoMeta, PhotoUpload, RemoteSession, UploadedPhoto};
pub use payload::{compress, CompressOptions, DataUrl, MAX_UPLOAD_BYTES};
pub use service::{RemoteDataService, SessionWatcher};

#[cfg(feature = "http")]
pub use http::{HttpBackend, HttpBackendConfig};

#[cfg(feature = "nextcloud")]
pub use login_flow::{LoginFlow, LoginFlowInit, LoginFlowResult};

#[cfg(feature = "nextcloud")]
pub use nextcloud::{NextcloudBackend, NextcloudConfig};
