//! Who is signed in, and the credential every remote call runs with.

use crate::error::SyncError;
use booth_cloud::{Credential, RemoteDataService};
use booth_store::{LocalStore, UserProfile};
use std::sync::{Arc, RwLock};

/// Current identity, cached in the local store for offline display
pub struct AuthSession {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteDataService>,
    credential: RwLock<Option<Credential>>,
}

impl AuthSession {
    /// Picks up a cached credential and installs it on the backend
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteDataService>,
    ) -> Result<Self, SyncError> {
        let cached = match (store.auth_token()?, store.auth_user()?) {
            (Some(token), Some(user)) => Some(Credential { token, user }),
            _ => None,
        };
        if let Some(credential) = &cached {
            log::debug!("Found cached credential for {}", credential.user.email);
        }
        remote.set_credential(cached.as_ref());

        Ok(Self {
            store,
            remote,
            credential: RwLock::new(cached),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential().is_some()
    }

    pub fn credential(&self) -> Option<Credential> {
        match self.credential.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.credential().map(|c| c.user)
    }

    pub fn user_id(&self) -> Option<String> {
        self.credential().map(|c| c.user.id)
    }

    fn install(&self, credential: Option<Credential>) {
        self.remote.set_credential(credential.as_ref());
        match self.credential.write() {
            Ok(mut guard) => *guard = credential,
            Err(poisoned) => *poisoned.into_inner() = credential,
        }
    }

    /// Checks the cached credential on startup.
    ///
    /// A rejected credential is cleared. When the server cannot be reached the
    /// cached profile stays, so the booth keeps showing who is signed in.
    pub async fn restore(&self) -> Result<Option<UserProfile>, SyncError> {
        let Some(credential) = self.credential() else {
            return Ok(None);
        };

        match self.remote.verify(&credential).await {
            Ok(Some(user)) => {
                log::info!("Restored session for {}", user.email);
                self.store.set_auth_user(Some(&user))?;
                self.install(Some(Credential {
                    token: credential.token,
                    user: user.clone(),
                }));
                Ok(Some(user))
            }
            Ok(None) => {
                log::warn!("Stored credential is no longer valid");
                self.clear()?;
                Ok(None)
            }
            Err(e) if e.is_auth() => {
                log::warn!("Stored credential rejected: {}", e);
                self.clear()?;
                Ok(None)
            }
            Err(e) => {
                log::warn!("Could not verify credential, keeping cached profile: {}", e);
                Ok(Some(credential.user))
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, SyncError> {
        let credential = self.remote.authenticate(email, password).await?;
        log::info!("Signed in as {}", credential.user.email);
        self.adopt(credential)
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<UserProfile, SyncError> {
        let credential = self.remote.register(email, password, display_name).await?;
        log::info!("Registered {}", credential.user.email);
        self.adopt(credential)
    }

    /// Persists and installs a credential obtained elsewhere (e.g. a login flow)
    pub fn adopt(&self, credential: Credential) -> Result<UserProfile, SyncError> {
        self.store.set_auth_token(Some(&credential.token))?;
        self.store.set_auth_user(Some(&credential.user))?;
        let user = credential.user.clone();
        self.install(Some(credential));
        Ok(user)
    }

    /// Revokes the credential remotely if possible and forgets it locally
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        if let Some(credential) = self.credential() {
            if let Err(e) = self.remote.revoke(&credential).await {
                log::warn!("Remote sign-out failed, clearing locally anyway: {}", e);
            }
        }
        self.clear()
    }

    /// Forgets the credential without talking to the server
    pub fn clear(&self) -> Result<(), SyncError> {
        log::info!("Clearing stored credential");
        self.install(None);
        self.store.clear_auth()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booth_cloud::{MemoryBackend, RemoteError};
    use booth_store::StoreConfig;

    fn setup() -> (Arc<LocalStore>, MemoryBackend) {
        let store = Arc::new(LocalStore::open_in_memory(StoreConfig::default()).unwrap());
        (store, MemoryBackend::new())
    }

    #[tokio::test]
    async fn test_sign_in_persists_credential() {
        let (store, backend) = setup();
        backend.seed_account("booth@example.com", "secret");
        let auth = AuthSession::new(store.clone(), Arc::new(backend.clone())).unwrap();

        let user = auth.sign_in("booth@example.com", "secret").await.unwrap();
        assert!(auth.is_authenticated());
        assert_eq!(store.auth_user().unwrap(), Some(user));
        assert!(store.auth_token().unwrap().is_some());

        // A fresh session picks the cached credential up
        let again = AuthSession::new(store, Arc::new(backend)).unwrap();
        assert!(again.is_authenticated());
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let (store, backend) = setup();
        backend.seed_account("booth@example.com", "secret");
        let auth = AuthSession::new(store, Arc::new(backend)).unwrap();

        let result = auth.sign_in("booth@example.com", "wrong").await;
        assert!(matches!(result, Err(SyncError::Remote(ref e)) if e.is_auth()));
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_restore_clears_expired_credential() {
        let (store, backend) = setup();
        let credential = backend.seed_account("booth@example.com", "secret");
        let auth = AuthSession::new(store.clone(), Arc::new(backend.clone())).unwrap();
        auth.adopt(credential).unwrap();

        backend.expire_tokens();
        assert_eq!(auth.restore().await.unwrap(), None);
        assert!(!auth.is_authenticated());
        assert_eq!(store.auth_token().unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_offline_keeps_profile() {
        let (store, backend) = setup();
        let credential = backend.seed_account("booth@example.com", "secret");
        let auth = AuthSession::new(store.clone(), Arc::new(backend.clone())).unwrap();
        auth.adopt(credential.clone()).unwrap();

        backend.fail_next(1, RemoteError::Network("unreachable".to_string()));
        assert_eq!(auth.restore().await.unwrap(), Some(credential.user));
        assert!(auth.is_authenticated());
        assert!(store.auth_token().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sign_out_clears_even_if_revoke_fails() {
        let (store, backend) = setup();
        let credential = backend.seed_account("booth@example.com", "secret");
        let auth = AuthSession::new(store.clone(), Arc::new(backend.clone())).unwrap();
        auth.adopt(credential).unwrap();

        backend.set_offline(true);
        auth.sign_out().await.unwrap();
        assert!(!auth.is_authenticated());
        assert_eq!(store.auth_user().unwrap(), None);
    }
}
