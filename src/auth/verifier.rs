//! RS256 ID token verifier.

use super::cache::TokenCache;
use super::keys::KeySet;
use super::{AuthError, IdentityVerifier, Subject, ANONYMOUS_PROVIDER};
use crate::config::AuthConfig;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Claims read from an ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id).
    #[serde(default)]
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Audience (project id).
    pub aud: String,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Issued at, unix seconds.
    #[serde(default)]
    pub iat: i64,
    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Provider-specific claims.
    #[serde(default)]
    pub firebase: ProviderClaims,
}

/// Provider block of an ID token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderClaims {
    /// Sign-in provider, `"anonymous"` for guest sessions.
    #[serde(default)]
    pub sign_in_provider: String,
}

impl TokenClaims {
    /// Convert validated claims into a subject.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingSubject`] when `sub` is blank.
    pub fn into_subject(self) -> Result<Subject, AuthError> {
        let id = self.sub.trim();
        if id.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(Subject {
            id: id.to_string(),
            is_anonymous: self.firebase.sign_in_provider == ANONYMOUS_PROVIDER,
            email: self.email.filter(|email| !email.is_empty()),
        })
    }
}

/// Verifies RS256-signed ID tokens against a [`KeySet`].
pub struct JwtVerifier {
    keys: KeySet,
    validation: Validation,
    cache: TokenCache,
}

impl JwtVerifier {
    /// Create a verifier with an explicit key set.
    #[must_use]
    pub fn new(config: &AuthConfig, keys: KeySet) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[config.expected_issuer()]);
        validation.set_audience(&[config.project_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.leeway = config.leeway_secs;

        info!(
            "Identity verifier initialized (issuer={}, audience={})",
            config.expected_issuer(),
            config.project_id
        );

        Self {
            keys,
            validation,
            cache: TokenCache::with_capacity(config.token_cache_capacity),
        }
    }

    /// Create a verifier that fetches keys from the configured JWKS URL.
    #[must_use]
    pub fn from_config(config: &AuthConfig, client: reqwest::Client) -> Self {
        let keys = KeySet::remote(
            client,
            config.jwks_url.clone(),
            Duration::from_secs(config.key_refresh_secs),
        );
        Self::new(config, keys)
    }

    /// Access the verified-token cache.
    #[must_use]
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, raw_credential: &str) -> Result<Subject, AuthError> {
        let now = chrono::Utc::now().timestamp();
        if let Some(subject) = self.cache.get(raw_credential, now) {
            debug!("Token cache hit for subject {}", subject.id);
            return Ok(subject);
        }

        let header = decode_header(raw_credential)
            .map_err(|e| AuthError::InvalidCredential(format!("malformed token: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidCredential(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidCredential("token has no key id".to_string()))?;

        let key = self.keys.decoding_key(&kid).await?;
        let data = decode::<TokenClaims>(raw_credential, &key, &self.validation)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;

        let expires_at = data.claims.exp;
        let subject = data.claims.into_subject()?;
        self.cache.insert(raw_credential, subject.clone(), expires_at);

        debug!(
            "Verified token for subject {} (anonymous={})",
            subject.id, subject.is_anonymous
        );
        Ok(subject)
    }
}
