//! Signing key set used to verify ID tokens.
//!
//! Keys come either from a fixed JWKS document (tests, offline deployments)
//! or from a remote JWKS endpoint. Remote keys are cached for the
//! `Cache-Control: max-age` the endpoint advertises and refetched on expiry
//! or when a token names a key id we have not seen.

use super::AuthError;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use reqwest::header::CACHE_CONTROL;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum gap between refetches triggered by an unknown key id.
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

enum KeySource {
    Static,
    Remote { client: reqwest::Client, url: String },
}

struct CachedKeys {
    jwks: JwkSet,
    fetched_at: Instant,
    expires_at: Option<Instant>,
}

/// A set of token signing keys.
pub struct KeySet {
    source: KeySource,
    cached: RwLock<Option<CachedKeys>>,
    refresh_fallback: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl KeySet {
    /// Use a fixed key set that never refreshes.
    #[must_use]
    pub fn from_jwks(jwks: JwkSet) -> Self {
        Self {
            source: KeySource::Static,
            cached: RwLock::new(Some(CachedKeys {
                jwks,
                fetched_at: Instant::now(),
                expires_at: None,
            })),
            refresh_fallback: Duration::ZERO,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Parse a fixed key set from a JWKS JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid JWKS.
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        let jwks: JwkSet = serde_json::from_str(json)
            .map_err(|e| AuthError::KeysUnavailable(format!("invalid JWKS document: {e}")))?;
        Ok(Self::from_jwks(jwks))
    }

    /// Fetch keys lazily from a JWKS endpoint.
    #[must_use]
    pub fn remote(client: reqwest::Client, url: impl Into<String>, refresh_fallback: Duration) -> Self {
        Self {
            source: KeySource::Remote {
                client,
                url: url.into(),
            },
            cached: RwLock::new(None),
            refresh_fallback,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cached
            .read()
            .as_ref()
            .map_or(0, |cached| cached.jwks.keys.len())
    }

    /// Check if no keys are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the decoding key for a key id.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] for an unknown key id and
    /// [`AuthError::KeysUnavailable`] when the endpoint cannot be reached.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        match self.lookup(kid) {
            Lookup::Found(key) => return key,
            Lookup::Missing if matches!(self.source, KeySource::Static) => {
                return Err(AuthError::InvalidCredential(format!("unknown key id {kid}")));
            }
            Lookup::Missing | Lookup::Stale => {}
        }

        self.refresh(kid).await?;

        match self.lookup(kid) {
            Lookup::Found(key) => key,
            Lookup::Missing | Lookup::Stale => {
                Err(AuthError::InvalidCredential(format!("unknown key id {kid}")))
            }
        }
    }

    fn lookup(&self, kid: &str) -> Lookup {
        let guard = self.cached.read();
        let Some(cached) = guard.as_ref() else {
            return Lookup::Stale;
        };
        if cached.expires_at.is_some_and(|at| Instant::now() >= at) {
            return Lookup::Stale;
        }
        cached.jwks.find(kid).map_or(Lookup::Missing, |jwk| {
            Lookup::Found(DecodingKey::from_jwk(jwk).map_err(|e| {
                AuthError::KeysUnavailable(format!("unusable key {kid}: {e}"))
            }))
        })
    }

    async fn refresh(&self, kid: &str) -> Result<(), AuthError> {
        let KeySource::Remote { client, url } = &self.source else {
            return Ok(());
        };

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited.
        let recently_fetched = {
            let guard = self.cached.read();
            guard.as_ref().is_some_and(|cached| {
                let fresh = cached.expires_at.map_or(true, |at| Instant::now() < at);
                fresh
                    && (cached.jwks.find(kid).is_some()
                        || cached.fetched_at.elapsed() < MIN_REFETCH_INTERVAL)
            })
        };
        if recently_fetched {
            debug!("Signing keys already fresh, skipping refetch");
            return Ok(());
        }

        debug!("Fetching signing keys from {url}");
        let response = client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!("Signing key fetch failed: {e}");
                AuthError::KeysUnavailable(e.to_string())
            })?;

        let ttl = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(self.refresh_fallback);

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeysUnavailable(format!("invalid JWKS response: {e}")))?;

        info!(
            "Loaded {} signing keys (refresh in {}s)",
            jwks.keys.len(),
            ttl.as_secs()
        );

        let now = Instant::now();
        *self.cached.write() = Some(CachedKeys {
            jwks,
            fetched_at: now,
            expires_at: Some(now + ttl),
        });
        Ok(())
    }
}

enum Lookup {
    Found(Result<DecodingKey, AuthError>),
    Missing,
    Stale,
}

/// Extract `max-age` seconds from a `Cache-Control` header value.
fn parse_max_age(value: &str) -> Option<Duration> {
    value
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
