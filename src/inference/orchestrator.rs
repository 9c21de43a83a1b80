//! Sequential fallback across inference backends.

use super::{BackendError, ImagePayload, Inference, InferenceBackend, InferenceError};
use crate::event::{ScanEvent, ScanEventsSender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one backend attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The backend returned text.
    Success(String),
    /// The backend failed with the given message.
    Failure(String),
}

/// Counters for one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Attempts that produced text.
    pub successes: u64,
    /// Attempts that failed for any reason other than a timeout.
    pub failures: u64,
    /// Attempts that ran out of time.
    pub timeouts: u64,
}

/// Tries each backend in order until one succeeds.
pub struct FallbackOrchestrator {
    backends: Vec<Arc<dyn InferenceBackend>>,
    attempt_timeout: Duration,
    stats: RwLock<HashMap<String, BackendStats>>,
    events: Option<ScanEventsSender>,
}

impl FallbackOrchestrator {
    /// Create an orchestrator over `backends`, in priority order.
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn InferenceBackend>>, attempt_timeout: Duration) -> Self {
        let names: Vec<&str> = backends.iter().map(|backend| backend.name()).collect();
        info!("Inference fallback order: {}", names.join(" -> "));
        Self {
            backends,
            attempt_timeout,
            stats: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Report failed attempts on `events`.
    #[must_use]
    pub fn with_events(mut self, events: ScanEventsSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Backend names, in priority order.
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.name().to_string())
            .collect()
    }

    /// Counters for one backend.
    #[must_use]
    pub fn stats_for(&self, backend: &str) -> BackendStats {
        self.stats.read().get(backend).copied().unwrap_or_default()
    }

    /// Counters for every backend attempted so far.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, BackendStats> {
        self.stats.read().clone()
    }

    /// Describe `image`, falling back through the backend list.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::AllFailed`] with one `"{backend}: {message}"`
    /// entry per backend when none succeeded. An empty backend list fails
    /// with no entries.
    pub async fn infer(
        &self,
        instruction: &str,
        image: &ImagePayload,
    ) -> Result<Inference, InferenceError> {
        let mut messages = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            let name = backend.name();
            debug!("Trying backend {name}");

            match self.attempt(backend.as_ref(), instruction, image).await {
                AttemptOutcome::Success(text) => {
                    info!("Backend {name} produced {} chars", text.len());
                    return Ok(Inference {
                        text,
                        backend: name.to_string(),
                    });
                }
                AttemptOutcome::Failure(message) => {
                    warn!("Backend {name} failed: {message}");
                    if let Some(events) = &self.events {
                        let _ = events.send(ScanEvent::BackendFailed {
                            backend: name.to_string(),
                            message: message.clone(),
                        });
                    }
                    messages.push(format!("{name}: {message}"));
                }
            }
        }

        Err(InferenceError::AllFailed { messages })
    }

    async fn attempt(
        &self,
        backend: &dyn InferenceBackend,
        instruction: &str,
        image: &ImagePayload,
    ) -> AttemptOutcome {
        let result =
            match tokio::time::timeout(self.attempt_timeout, backend.generate(instruction, image))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.attempt_timeout)),
            };

        let mut stats = self.stats.write();
        let entry = stats.entry(backend.name().to_string()).or_default();
        match result {
            Ok(text) => {
                entry.successes += 1;
                AttemptOutcome::Success(text)
            }
            Err(e @ BackendError::Timeout(_)) => {
                entry.timeouts += 1;
                AttemptOutcome::Failure(e.to_string())
            }
            Err(e) => {
                entry.failures += 1;
                AttemptOutcome::Failure(e.to_string())
            }
        }
    }
}
