//! Test harness that wires the service with in-memory collaborators.
//!
//! The `TestHarness` provides a unified interface for E2E tests: real token
//! verification against a fixed RS256 key, in-memory quota ledger, artifact
//! store and scan repository, scripted inference backends and a clock the
//! test controls.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use foodsense::auth::{IdentityVerifier, JwtVerifier, KeySet};
use foodsense::config::{AuthConfig, ServiceConfig};
use foodsense::event::create_event_channel;
use foodsense::inference::{BackendError, FallbackOrchestrator, ImagePayload, InferenceBackend};
use foodsense::quota::{period_key, Clock, ManualClock, MemoryLedger, Tier, TierPolicy, UsageRecord};
use foodsense::scans::MemoryScanRepository;
use foodsense::storage::{MemoryStore, UploadedArtifact};
use foodsense::{
    ScanEventsChannel, ScanPipeline, ScanRequest, ServerBuilder, ShutdownHandle,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const TEST_JWKS: &str = include_str!("../fixtures/test-jwks.json");
const TEST_KEY: &str = include_str!("../fixtures/test-signing-key.pem");
const TEST_KID: &str = "test-key-1";

/// Project id the harness signs tokens for.
pub const TEST_PROJECT: &str = "foodsense-test";

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Service error
    #[error("Service error: {0}")]
    Service(#[from] foodsense::Error),

    /// Token minting error
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// An inference backend that always answers the same way.
pub struct ScriptedBackend {
    name: String,
    reply: std::result::Result<String, String>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    /// A backend that returns `text`.
    pub fn working(name: &str, text: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    /// A backend that fails with `message`.
    pub fn failing(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of times the backend was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        _instruction: &str,
        _image: &ImagePayload,
    ) -> std::result::Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().map_err(|message| BackendError::Provider {
            status: 500,
            message,
        })
    }
}

/// Test harness that manages the complete test environment.
pub struct TestHarness {
    /// Service configuration (port 0 on loopback).
    pub config: ServiceConfig,
    /// Clock driving quota periods.
    pub clock: Arc<ManualClock>,
    /// Usage ledger.
    pub ledger: Arc<MemoryLedger>,
    /// Artifact store.
    pub store: Arc<MemoryStore>,
    /// Scan records.
    pub scans: Arc<MemoryScanRepository>,
    /// Backends in priority order.
    pub backends: Vec<Arc<ScriptedBackend>>,
    verifier: Arc<JwtVerifier>,
    encoding_key: EncodingKey,
}

impl TestHarness {
    /// Harness with a single working backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the fixture keys cannot be loaded.
    pub fn setup() -> Result<Self> {
        Self::setup_with_backends(vec![ScriptedBackend::working(
            "gemini-2.0-flash",
            "A bowl of oatmeal topped with blueberries.",
        )])
    }

    /// Harness with the given backends, in priority order.
    ///
    /// # Errors
    ///
    /// Returns an error if the fixture keys cannot be loaded.
    pub fn setup_with_backends(backends: Vec<Arc<ScriptedBackend>>) -> Result<Self> {
        let config = ServiceConfig {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            auth: AuthConfig {
                project_id: TEST_PROJECT.to_string(),
                ..AuthConfig::default()
            },
            ..ServiceConfig::default()
        };

        let keys = KeySet::from_json(TEST_JWKS).map_err(foodsense::Error::from)?;
        let verifier = Arc::new(JwtVerifier::new(&config.auth, keys));
        let clock = Arc::new(ManualClock::new(october()));
        let policy = TierPolicy {
            guest_limit: config.quota.guest_limit,
            free_limit: config.quota.free_limit,
        };

        info!("Setting up test harness with {} backends", backends.len());
        Ok(Self {
            ledger: Arc::new(MemoryLedger::with_clock(policy, clock.clone())),
            store: Arc::new(MemoryStore::new()),
            scans: Arc::new(MemoryScanRepository::new()),
            encoding_key: EncodingKey::from_rsa_pem(TEST_KEY.as_bytes())?,
            verifier,
            clock,
            backends,
            config,
        })
    }

    fn dyn_backends(&self) -> Vec<Arc<dyn InferenceBackend>> {
        self.backends
            .iter()
            .map(|backend| Arc::clone(backend) as Arc<dyn InferenceBackend>)
            .collect()
    }

    /// Build a pipeline over the harness components.
    pub fn pipeline(&self) -> ScanPipeline {
        let orchestrator =
            FallbackOrchestrator::new(self.dyn_backends(), Duration::from_secs(2));
        ScanPipeline::new(
            self.verifier.clone(),
            self.ledger.clone(),
            self.store.clone(),
            Arc::new(orchestrator),
            self.scans.clone(),
            self.config.inference.instruction.clone(),
        )
    }

    /// Build a pipeline that reports events.
    pub fn pipeline_with_events(&self) -> (ScanPipeline, ScanEventsChannel) {
        let (tx, rx) = create_event_channel();
        (self.pipeline().with_events(tx), rx)
    }

    /// Start the HTTP server on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn spawn_server(&self) -> Result<TestServer> {
        let verifier: Arc<dyn IdentityVerifier> = self.verifier.clone();
        let mut server = ServerBuilder::new(self.config.clone())
            .with_verifier(verifier)
            .with_ledger(self.ledger.clone())
            .with_store(self.store.clone())
            .with_scans(self.scans.clone())
            .with_backends(self.dyn_backends())
            .without_signal_handlers()
            .build()
            .await?;

        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(async move { server.run().await });
        info!("Test server listening on {addr}");

        Ok(TestServer {
            addr,
            shutdown,
            task,
        })
    }

    /// Sign a token for an anonymous subject.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn anonymous_token(&self, subject_id: &str) -> Result<String> {
        self.sign(subject_id, "anonymous", None)
    }

    /// Sign a token for a signed-in subject.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn user_token(&self, subject_id: &str, email: &str) -> Result<String> {
        self.sign(subject_id, "google.com", Some(email))
    }

    fn sign(&self, subject_id: &str, provider: &str, email: Option<&str>) -> Result<String> {
        let now = Utc::now().timestamp();
        let mut claims = json!({
            "sub": subject_id,
            "iss": self.config.auth.expected_issuer(),
            "aud": TEST_PROJECT,
            "iat": now,
            "exp": now + 3600,
            "firebase": { "sign_in_provider": provider },
        });
        if let Some(email) = email {
            claims["email"] = json!(email);
        }
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(TEST_KID.to_string());
        Ok(encode(&header, &claims, &self.encoding_key)?)
    }

    /// Put a subject's usage at `count` for the current month.
    pub fn seed_usage(&self, subject_id: &str, tier: Tier, count: u64) {
        self.ledger.seed(
            subject_id,
            UsageRecord {
                tier,
                period: period_key(self.clock.now()),
                count,
            },
        );
    }

    /// Move the quota clock.
    pub fn set_time(&self, now: DateTime<Utc>) {
        self.clock.set(now);
    }

    /// Current usage count of a subject (0 when unseen).
    pub async fn usage_count(&self, subject_id: &str) -> u64 {
        use foodsense::quota::QuotaLedger;
        self.ledger
            .usage(subject_id)
            .await
            .ok()
            .flatten()
            .map_or(0, |record| record.count)
    }
}

/// A running HTTP server.
pub struct TestServer {
    /// Bound address.
    pub addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: tokio::task::JoinHandle<foodsense::Result<()>>,
}

impl TestServer {
    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Stop the server and wait for it to exit.
    pub async fn teardown(self) {
        self.shutdown.shutdown();
        let _ = self.task.await;
    }
}

/// A fixed mid-month instant.
pub fn october() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A JPEG-looking upload.
pub fn jpeg_upload(filename: &str) -> UploadedArtifact {
    UploadedArtifact::new(
        bytes::Bytes::from_static(b"\xff\xd8\xff\xe0fake-jpeg-body"),
        Some("image/jpeg".to_string()),
        Some(filename.to_string()),
    )
}

/// A scan request with a token and a JPEG upload.
pub fn scan_request(token: &str) -> ScanRequest {
    ScanRequest {
        credential: Some(token.to_string()),
        upload: Some(jpeg_upload("plate.jpg")),
    }
}
