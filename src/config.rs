//! Configuration for the foodsense service.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Default JWKS endpoint for secure-token ID tokens.
pub const DEFAULT_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Default generative language API base URL.
pub const DEFAULT_INFERENCE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Fixed instruction sent with every image.
pub const DEFAULT_INSTRUCTION: &str =
    "Describe this image in detail and identify key elements such as nutrition.";

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address to bind the HTTP listener to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// Listening port (0 for auto-select).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Identity verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Quota ledger.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Artifact storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Inference backends.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Identity verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Identity project id; expected `aud` claim.
    #[serde(default)]
    pub project_id: String,

    /// JWKS endpoint publishing the token signing keys.
    #[serde(default = "default_jwks_url")]
    pub jwks_url: String,

    /// Expected `iss` claim. Derived from `project_id` when unset.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Cookie carrying the token when no `Authorization` header is sent.
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Fallback key refresh interval when the JWKS response has no max-age.
    #[serde(default = "default_key_refresh_secs")]
    pub key_refresh_secs: u64,

    /// Clock skew tolerated on `exp`/`iat`.
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,

    /// Number of verified tokens kept in memory.
    #[serde(default = "default_token_cache_capacity")]
    pub token_cache_capacity: usize,
}

/// Quota ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Monthly scans for anonymous subjects.
    #[serde(default = "default_guest_limit")]
    pub guest_limit: u64,

    /// Monthly scans for signed-in, non-paying subjects.
    #[serde(default = "default_free_limit")]
    pub free_limit: u64,

    /// Redis URL for usage and scan records.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix for all records written to Redis.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Artifact storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stored uploads.
    #[serde(default = "default_storage_root")]
    pub root_dir: PathBuf,
}

/// Inference backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL.
    #[serde(default = "default_inference_base_url")]
    pub api_base_url: String,

    /// Models in priority order.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Per-attempt timeout in seconds.
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,

    /// Instruction sent alongside every image.
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Include per-backend messages in the client-facing error.
    #[serde(default)]
    pub expose_diagnostics: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            auth: AuthConfig::default(),
            quota: QuotaConfig::default(),
            storage: StorageConfig::default(),
            inference: InferenceConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            jwks_url: default_jwks_url(),
            issuer: None,
            session_cookie: default_session_cookie(),
            key_refresh_secs: default_key_refresh_secs(),
            leeway_secs: default_leeway_secs(),
            token_cache_capacity: default_token_cache_capacity(),
        }
    }
}

impl AuthConfig {
    /// The issuer tokens must carry.
    #[must_use]
    pub fn expected_issuer(&self) -> String {
        self.issuer.clone().unwrap_or_else(|| {
            format!("https://securetoken.google.com/{}", self.project_id)
        })
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            guest_limit: default_guest_limit(),
            free_limit: default_free_limit(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            api_base_url: default_inference_base_url(),
            models: default_models(),
            timeout_secs: default_inference_timeout(),
            instruction: default_instruction(),
            expose_diagnostics: false,
        }
    }
}

fn default_listen_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

const fn default_port() -> u16 {
    8080
}

const fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_jwks_url() -> String {
    DEFAULT_JWKS_URL.to_string()
}

fn default_session_cookie() -> String {
    "__session".to_string()
}

const fn default_key_refresh_secs() -> u64 {
    3600
}

const fn default_leeway_secs() -> u64 {
    60
}

const fn default_token_cache_capacity() -> usize {
    10_000
}

const fn default_guest_limit() -> u64 {
    10
}

const fn default_free_limit() -> u64 {
    25
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "foodsense".to_string()
}

fn default_storage_root() -> PathBuf {
    directories::ProjectDirs::from("", "", "foodsense")
        .map(|dirs| dirs.data_dir().join("artifacts"))
        .unwrap_or_else(|| PathBuf::from(".foodsense/artifacts"))
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_inference_base_url() -> String {
    DEFAULT_INFERENCE_BASE_URL.to_string()
}

fn default_models() -> Vec<String> {
    [
        "gemini-2.0-flash",
        "gemini-flash-latest",
        "gemini-pro-latest",
        "gemini-2.0-flash-exp",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

const fn default_inference_timeout() -> u64 {
    30
}

fn default_instruction() -> String {
    DEFAULT_INSTRUCTION.to_string()
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
