//! Booth configuration, read from a TOML file.
//!
//! Every field is optional; a missing file section falls back to defaults.
//! Without a `[backend]` section the booth uses the in-memory backend, which
//! forgets its accounts and data when the process exits.
//!
//! ```toml
//! [storage]
//! path = "./data/photobooth.db"
//!
//! [backend]
//! kind = "nextcloud"
//! base_url = "https://cloud.example.com"
//!
//! [sync]
//! session_push_debounce_ms = 800
//! ```

use crate::error::SyncError;
use booth_cloud::{
    CompressOptions, HttpBackend, HttpBackendConfig, MemoryBackend, NextcloudBackend,
    NextcloudConfig, RemoteDataService, MAX_UPLOAD_BYTES,
};
use booth_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoothConfig {
    pub storage: StorageOptions,
    pub backend: BackendOptions,
    pub sync: SyncOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// SQLite file backing the local store
    pub path: PathBuf,
    /// `0` disables the quota
    pub quota_bytes: u64,
    pub max_photos_after_trim: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            path: PathBuf::from("./data/photobooth.db"),
            quota_bytes: store.quota_bytes,
            max_photos_after_trim: store.max_photos_after_trim,
        }
    }
}

/// Which remote data service the booth talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Http,
    Nextcloud,
    /// Process-local, for tests and demos
    #[default]
    Memory,
}

impl BackendKind {
    /// Whether accounts (and so cached credentials) outlive this process
    pub fn keeps_accounts(self) -> bool {
        !matches!(self, BackendKind::Memory)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub kind: BackendKind,
    pub base_url: String,
    /// Folder below the Nextcloud user root
    pub remote_path: String,
    pub timeout_secs: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: String::new(),
            remote_path: "/Photobooth".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Tuning for pushes, compression and the realtime watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub max_upload_bytes: usize,
    pub compress_target_kb: usize,
    pub max_dimension: u32,
    pub session_push_debounce_ms: u64,
    pub realtime_poll_secs: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_upload_bytes: MAX_UPLOAD_BYTES,
            compress_target_kb: 800,
            max_dimension: 1200,
            session_push_debounce_ms: 800,
            realtime_poll_secs: 30,
        }
    }
}

impl SyncOptions {
    pub fn compress_options(&self) -> CompressOptions {
        CompressOptions {
            max_dimension: self.max_dimension,
            target_bytes: self.compress_target_kb * 1024,
        }
    }
}

impl BoothConfig {
    /// Reads the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        Ok(toml::from_str(content)?)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            quota_bytes: self.storage.quota_bytes,
            max_photos_after_trim: self.storage.max_photos_after_trim,
        }
    }

    /// Constructs the one remote data service this booth uses
    pub fn build_backend(&self) -> Result<Arc<dyn RemoteDataService>, SyncError> {
        let backend = &self.backend;
        let service: Arc<dyn RemoteDataService> = match backend.kind {
            BackendKind::Http => {
                require_url(backend)?;
                Arc::new(HttpBackend::new(HttpBackendConfig {
                    base_url: backend.base_url.clone(),
                    timeout_secs: backend.timeout_secs,
                    max_upload_bytes: self.sync.max_upload_bytes,
                })?)
            }
            BackendKind::Nextcloud => {
                require_url(backend)?;
                Arc::new(NextcloudBackend::new(NextcloudConfig {
                    server_url: backend.base_url.clone(),
                    remote_path: backend.remote_path.clone(),
                    timeout_secs: backend.timeout_secs,
                    max_upload_bytes: self.sync.max_upload_bytes,
                })?)
            }
            BackendKind::Memory => {
                log::warn!("Using the in-memory backend; nothing leaves this process");
                Arc::new(MemoryBackend::new().with_max_upload_bytes(self.sync.max_upload_bytes))
            }
        };
        log::info!("Remote data service: {}", service.name());
        Ok(service)
    }
}

fn require_url(backend: &BackendOptions) -> Result<(), SyncError> {
    if backend.base_url.trim().is_empty() {
        return Err(SyncError::Config(format!(
            "backend.base_url is required for the {:?} backend",
            backend.kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BoothConfig::from_toml_str("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.backend.remote_path, "/Photobooth");
        assert_eq!(config.storage.max_photos_after_trim, 100);
        assert_eq!(config.sync.max_upload_bytes, 5 * 1024 * 1024);
        assert_eq!(config.sync.session_push_debounce_ms, 800);
    }

    #[test]
    fn test_partial_sections() {
        let config = BoothConfig::from_toml_str(
            r#"
            [backend]
            kind = "nextcloud"
            base_url = "https://cloud.example.com"

            [sync]
            compress_target_kb = 400
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.kind, BackendKind::Nextcloud);
        assert_eq!(config.backend.timeout_secs, 60);
        assert_eq!(config.sync.compress_options().target_bytes, 400 * 1024);
        assert_eq!(config.sync.max_dimension, 1200);
    }

    #[test]
    fn test_only_memory_backend_forgets_accounts() {
        assert!(!BoothConfig::default().backend.kind.keeps_accounts());
        assert!(BackendKind::Http.keeps_accounts());
        assert!(BackendKind::Nextcloud.keeps_accounts());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = BoothConfig::from_toml_str("[backend]\nkind = \"ftp\"\n");
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_remote_backend_needs_url() {
        let mut config = BoothConfig::default();
        config.backend.kind = BackendKind::Http;
        assert!(matches!(config.build_backend(), Err(SyncError::Config(_))));

        config.backend.kind = BackendKind::Memory;
        assert_eq!(config.build_backend().unwrap().name(), "memory");
    }
}
