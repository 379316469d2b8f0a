use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use jsonwebtoken::{jwk::Jwk, DecodingKey};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult},
    services::metrics::JWKS_FETCHES_COUNTER,
};

/// Signing keys published by the identity provider, indexed by key id.
///
/// An unknown key id triggers at most one download per `min_refresh` window;
/// lookups inside the window fail fast instead of hitting the provider again.
pub struct JwksCache {
    http: Client,
    certs_url: String,
    min_refresh: Duration,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_fetch: Mutex<Option<Instant>>,
}

impl JwksCache {
    pub fn new(http: Client, certs_url: String, min_refresh: Duration) -> Self {
        Self {
            http,
            certs_url,
            min_refresh,
            keys: RwLock::new(HashMap::new()),
            last_fetch: Mutex::new(None),
        }
    }

    pub async fn key(&self, kid: &str) -> AppResult<DecodingKey> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        let mut last_fetch = self.last_fetch.lock().await;

        // Another caller may have refreshed while we waited on the lock.
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        if let Some(at) = *last_fetch {
            if at.elapsed() < self.min_refresh {
                debug!(%kid, "unknown key id, refresh rate-limited");
                return Err(AppError::KeyResolutionFailed(format!("Unknown key id {kid}")));
            }
        }

        *last_fetch = Some(Instant::now());
        let fresh = self.fetch().await?;
        let found = fresh.get(kid).cloned();
        *self.keys.write().await = fresh;

        found.ok_or_else(|| AppError::KeyResolutionFailed(format!("Unknown key id {kid}")))
    }

    async fn fetch(&self) -> AppResult<HashMap<String, DecodingKey>> {
        let result = self.download().await;
        let status = if result.is_ok() { "success" } else { "failure" };
        JWKS_FETCHES_COUNTER.with_label_values(&[status]).inc();
        result
    }

    async fn download(&self) -> AppResult<HashMap<String, DecodingKey>> {
        let response = self
            .http
            .get(&self.certs_url)
            .send()
            .await
            .map_err(|e| AppError::KeyResolutionFailed(format!("Key set unreachable: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "key set request rejected");
            return Err(AppError::KeyResolutionFailed(format!("Key set request returned {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::KeyResolutionFailed(format!("Unreadable key set: {e}")))?;

        let keys = parse_key_set(&body);
        info!(count = keys.len(), "refreshed signing keys");
        Ok(keys)
    }
}

/// Signature keys with a usable `kid`; encryption keys and unparseable entries are skipped.
fn parse_key_set(body: &Value) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    let Some(entries) = body.get("keys").and_then(Value::as_array) else {
        return keys;
    };

    for entry in entries {
        if entry.get("use").and_then(Value::as_str) == Some("enc") {
            continue;
        }
        let Some(kid) = entry.get("kid").and_then(Value::as_str) else {
            continue;
        };
        let parsed = serde_json::from_value::<Jwk>(entry.clone())
            .map_err(|e| e.to_string())
            .and_then(|jwk| DecodingKey::from_jwk(&jwk).map_err(|e| e.to_string()));
        match parsed {
            Ok(key) => {
                keys.insert(kid.to_string(), key);
            }
            Err(e) => debug!(%kid, error = %e, "skipping unusable key"),
        }
    }
    keys
}
