//! Service assembly and lifecycle.

use crate::auth::{IdentityVerifier, JwtVerifier};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, ScanEventsChannel, ScanEventsSender};
use crate::http::{build_router, AppState};
use crate::inference::{FallbackOrchestrator, GeminiBackend, InferenceBackend};
use crate::pipeline::ScanPipeline;
use crate::quota::{QuotaLedger, RedisLedger, TierPolicy};
use crate::scans::{RedisScanRepository, ScanRepository};
use crate::storage::{ArtifactStore, LocalFsStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builder for the analysis service.
///
/// Collaborators not supplied explicitly are built from the configuration:
/// a JWKS-backed verifier, Redis ledger and scan repository, a filesystem
/// artifact store and one Gemini backend per configured model.
pub struct ServerBuilder {
    config: ServiceConfig,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    ledger: Option<Arc<dyn QuotaLedger>>,
    store: Option<Arc<dyn ArtifactStore>>,
    backends: Option<Vec<Arc<dyn InferenceBackend>>>,
    scans: Option<Arc<dyn ScanRepository>>,
    handle_signals: bool,
}

impl ServerBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            verifier: None,
            ledger: None,
            store: None,
            backends: None,
            scans: None,
            handle_signals: true,
        }
    }

    /// Use a specific identity verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Use a specific quota ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn QuotaLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use a specific artifact store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use specific inference backends, in priority order.
    #[must_use]
    pub fn with_backends(mut self, backends: Vec<Arc<dyn InferenceBackend>>) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Use a specific scan repository.
    #[must_use]
    pub fn with_scans(mut self, scans: Arc<dyn ScanRepository>) -> Self {
        self.scans = Some(scans);
        self
    }

    /// Do not listen for Ctrl-C or SIGTERM; only [`RunningServer::shutdown`]
    /// stops the server.
    #[must_use]
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Build collaborators and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if a backing service is unreachable, the inference
    /// API key is missing or the address cannot be bound.
    pub async fn build(self) -> Result<RunningServer> {
        let config = self.config;
        info!(
            "Building foodsense-api on {}:{}",
            config.listen_addr, config.port
        );

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("foodsense/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;

        let verifier: Arc<dyn IdentityVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None => Arc::new(JwtVerifier::from_config(&config.auth, http_client.clone())),
        };

        let policy = TierPolicy {
            guest_limit: config.quota.guest_limit,
            free_limit: config.quota.free_limit,
        };
        let ledger: Arc<dyn QuotaLedger> = match self.ledger {
            Some(ledger) => ledger,
            None => Arc::new(
                RedisLedger::connect(&config.quota.redis_url, &config.quota.key_prefix, policy)
                    .await?,
            ),
        };

        let store: Arc<dyn ArtifactStore> = match self.store {
            Some(store) => store,
            None => {
                std::fs::create_dir_all(&config.storage.root_dir)?;
                Arc::new(LocalFsStore::new(config.storage.root_dir.clone()))
            }
        };

        let scans: Arc<dyn ScanRepository> = match self.scans {
            Some(scans) => scans,
            None => Arc::new(
                RedisScanRepository::connect(&config.quota.redis_url, &config.quota.key_prefix)
                    .await?,
            ),
        };

        let backends: Vec<Arc<dyn InferenceBackend>> = match self.backends {
            Some(backends) => backends,
            None => gemini_backends(&config, &http_client)?,
        };

        let (events_tx, events_rx) = create_event_channel();
        let orchestrator = FallbackOrchestrator::new(
            backends,
            Duration::from_secs(config.inference.timeout_secs),
        )
        .with_events(events_tx.clone());

        let pipeline = Arc::new(
            ScanPipeline::new(
                verifier,
                ledger,
                store,
                Arc::new(orchestrator),
                scans,
                config.inference.instruction.clone(),
            )
            .with_events(events_tx.clone()),
        );

        let listener = TcpListener::bind(SocketAddr::new(config.listen_addr, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(RunningServer {
            config,
            pipeline,
            listener: Some(listener),
            local_addr,
            handle_signals: self.handle_signals,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

fn gemini_backends(
    config: &ServiceConfig,
    client: &reqwest::Client,
) -> Result<Vec<Arc<dyn InferenceBackend>>> {
    let api_key = std::env::var(&config.inference.api_key_env).map_err(|_| {
        Error::Config(format!(
            "inference API key not set (expected in ${})",
            config.inference.api_key_env
        ))
    })?;
    if config.inference.models.is_empty() {
        return Err(Error::Config("no inference models configured".to_string()));
    }

    Ok(config
        .inference
        .models
        .iter()
        .map(|model| {
            Arc::new(GeminiBackend::new(
                client.clone(),
                &config.inference.api_base_url,
                model,
                &api_key,
            )) as Arc<dyn InferenceBackend>
        })
        .collect())
}

/// Cloneable handle that stops a running server.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Request shutdown. In-flight requests are allowed to finish.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// A bound, ready-to-run service.
pub struct RunningServer {
    config: ServiceConfig,
    pipeline: Arc<ScanPipeline>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    handle_signals: bool,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: ScanEventsSender,
    events_rx: Option<ScanEventsChannel>,
}

impl RunningServer {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The scan pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<ScanPipeline> {
        &self.pipeline
    }

    /// Get a receiver for scan events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<ScanEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to scan events.
    #[must_use]
    pub fn subscribe_events(&self) -> ScanEventsChannel {
        self.events_tx.subscribe()
    }

    /// Handle for stopping the server from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }

    /// Serve requests until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already run or fails while serving.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Http("server already running".to_string()))?;

        let router = build_router(
            AppState {
                pipeline: Arc::clone(&self.pipeline),
                session_cookie: self.config.auth.session_cookie.clone(),
                expose_diagnostics: self.config.inference.expose_diagnostics,
            },
            self.config.max_upload_bytes,
        );

        info!("foodsense-api listening on {}", self.local_addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(
                self.shutdown_rx.clone(),
                self.handle_signals,
            ))
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Request the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>, handle_signals: bool) {
    let requested = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        info!("Shutdown requested");
    };

    let ctrl_c = async {
        if !handle_signals {
            return std::future::pending::<()>().await;
        }
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, initiating shutdown"),
            Err(e) => {
                warn!("Failed to install Ctrl-C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        if !handle_signals {
            return std::future::pending::<()>().await;
        }
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("SIGTERM received, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = requested => {},
        () = ctrl_c => {},
        () = terminate => {},
    }
}
