//! Self-hosted backend: a JSON API with bearer tokens.
//!
//! Every response carries `{success, error?}` next to its payload. Designs
//! have no blob route on this backend and travel inline as data URLs.

use crate::error::RemoteError;
use crate::models::{Credential, PhotoMeta, PhotoUpload, RemoteSession, UploadedPhoto};
use crate::payload::{ensure_within_limit, DataUrl, MAX_UPLOAD_BYTES};
use crate::service::RemoteDataService;
use async_trait::async_trait;
use booth_store::UserProfile;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::RwLock;

/// Configuration for the self-hosted backend
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Origin serving `/api/*`, e.g. `https://booth.example.com`
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_upload_bytes: usize,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: 60,
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

pub struct HttpBackend {
    config: HttpBackendConfig,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .user_agent(concat!("PhotoboothSync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(format!("Client build failed: {}", e)))?;

        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn token(&self) -> Result<String, RemoteError> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| RemoteError::Unauthorized("Not authenticated".to_string()))
    }

    /// Request with the installed bearer token
    fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
        Ok(self
            .client
            .request(method, self.url(path))
            .bearer_auth(self.token()?))
    }

    /// Sends a request and unwraps the `{success, error}` envelope
    async fn send(&self, request: RequestBuilder) -> Result<Value, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("Request failed: {}", e)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to read response: {}", e)))?;

        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !(200..300).contains(&status) => {
                return Err(RemoteError::from_status(status, text));
            }
            Err(e) => return Err(RemoteError::Decode(format!("Invalid JSON: {}", e))),
        };

        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Request failed")
            .to_string();

        if !(200..300).contains(&status) {
            log::debug!("Server returned status {}: {}", status, message);
            return Err(RemoteError::from_status(status, message));
        }
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(RemoteError::BadRequest(message));
        }
        Ok(body)
    }

    fn field<T: DeserializeOwned>(body: &Value, name: &str) -> Result<T, RemoteError> {
        let value = body.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| RemoteError::Decode(format!("Field '{}': {}", name, e)))
    }

    fn credential_from(body: &Value) -> Result<Credential, RemoteError> {
        Ok(Credential {
            token: Self::field(body, "token")?,
            user: Self::field(body, "user")?,
        })
    }
}

#[async_trait]
impl RemoteDataService for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn set_credential(&self, credential: Option<&Credential>) {
        *self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credential.map(|c| c.token.clone());
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<Credential, RemoteError> {
        let request = self
            .client
            .post(self.url("/api/auth"))
            .query(&[("action", "login")])
            .json(&json!({ "email": email, "password": password }));
        let body = self.send(request).await?;
        Self::credential_from(&body)
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Credential, RemoteError> {
        let request = self
            .client
            .post(self.url("/api/auth"))
            .query(&[("action", "signup")])
            .json(&json!({
                "email": email,
                "password": password,
                "displayName": display_name,
            }));
        let body = self.send(request).await?;
        Self::credential_from(&body)
    }

    async fn verify(&self, credential: &Credential) -> Result<Option<UserProfile>, RemoteError> {
        let request = self
            .client
            .get(self.url("/api/auth"))
            .query(&[("action", "me")])
            .bearer_auth(&credential.token);
        match self.send(request).await {
            Ok(body) => Ok(Some(Self::field(&body, "user")?)),
            Err(RemoteError::Unauthorized(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn revoke(&self, credential: &Credential) -> Result<(), RemoteError> {
        let request = self
            .client
            .post(self.url("/api/auth"))
            .query(&[("action", "logout")])
            .bearer_auth(&credential.token);
        self.send(request).await?;
        Ok(())
    }

    async fn create_or_update_session(
        &self,
        session: &RemoteSession,
    ) -> Result<String, RemoteError> {
        let request = self.authed(Method::POST, "/api/sessions")?.json(&json!({
            "id": session.id,
            "name": session.name,
            "designUrl": session.design_url,
            "settings": session.settings,
        }));
        let body = self.send(request).await?;
        let id = body
            .get("session")
            .and_then(|s| s.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| session.id.clone());
        Ok(id)
    }

    async fn list_sessions(&self) -> Result<Vec<RemoteSession>, RemoteError> {
        let body = self.send(self.authed(Method::GET, "/api/sessions")?).await?;
        Self::field(&body, "sessions")
    }

    async fn delete_session(&self, id: &str) -> Result<(), RemoteError> {
        let request = self
            .authed(Method::DELETE, "/api/sessions")?
            .query(&[("id", id)]);
        self.send(request).await?;
        Ok(())
    }

    async fn get_active_session(&self) -> Result<Option<String>, RemoteError> {
        let request = self
            .authed(Method::GET, "/api/sessions")?
            .query(&[("action", "get-active")]);
        let body = self.send(request).await?;
        Ok(match body.get("activeSessionId") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    async fn set_active_session(&self, id: Option<&str>) -> Result<(), RemoteError> {
        let request = self
            .authed(Method::POST, "/api/sessions")?
            .query(&[("action", "set-active")])
            .json(&json!({ "activeSessionId": id }));
        self.send(request).await?;
        Ok(())
    }

    async fn upload_design(
        &self,
        _session_id: &str,
        design: &DataUrl,
    ) -> Result<String, RemoteError> {
        ensure_within_limit(design.bytes.len(), self.config.max_upload_bytes)?;
        Ok(design.to_string())
    }

    async fn fetch_design(&self, reference: &str) -> Result<DataUrl, RemoteError> {
        if DataUrl::is_data_url(reference) {
            return DataUrl::parse(reference);
        }

        let response = self
            .authed(Method::GET, reference)?
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("Design download failed: {}", e)))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(RemoteError::from_status(status, reference.to_string()));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(format!("Failed to read design: {}", e)))?;
        Ok(DataUrl::new(mime, bytes.to_vec()))
    }

    async fn upload_photo(
        &self,
        payload: &DataUrl,
        meta: &PhotoUpload,
    ) -> Result<UploadedPhoto, RemoteError> {
        ensure_within_limit(payload.bytes.len(), self.config.max_upload_bytes)?;

        let request = self.authed(Method::POST, "/api/upload")?.json(&json!({
            "photoData": payload.to_string(),
            "photoId": meta.photo_id,
            "sessionId": meta.session_id,
            "isStrip": meta.is_strip,
            "isCollage": meta.is_collage,
        }));

        match self.send(request).await {
            Ok(body) => Ok(serde_json::from_value(body)?),
            Err(RemoteError::PayloadTooLarge { .. }) => Err(RemoteError::PayloadTooLarge {
                size: payload.bytes.len(),
                limit: self.config.max_upload_bytes,
            }),
            Err(e) => Err(e),
        }
    }

    async fn list_photos(&self, session_id: Option<&str>) -> Result<Vec<PhotoMeta>, RemoteError> {
        let mut request = self.authed(Method::GET, "/api/photos")?;
        if let Some(session_id) = session_id {
            request = request.query(&[("sessionId", session_id)]);
        }
        let body = self.send(request).await?;
        let mut photos: Vec<PhotoMeta> = Self::field(&body, "photos")?;
        photos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(photos)
    }

    async fn delete_photo(&self, id: &str) -> Result<(), RemoteError> {
        let request = self
            .authed(Method::DELETE, "/api/photos")?
            .query(&[("id", id)]);
        self.send(request).await?;
        Ok(())
    }

    async fn delete_all_photos(&self) -> Result<usize, RemoteError> {
        let body = self
            .send(self.authed(Method::DELETE, "/api/delete-photos")?)
            .await?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0) as usize)
    }
}
