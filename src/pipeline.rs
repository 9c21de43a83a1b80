//! The scan request pipeline.
//!
//! One request moves through these stages, strictly in order:
//!
//! ```text
//! Unauthenticated ──verify + reserve──► QuotaChecked ──save──► Uploaded
//!                                                                  │
//!         Responded ◄── Recorded ◄──persist── Inferred ◄──infer────┘
//! ```
//!
//! Any stage can abort the request. What happens to earlier side effects
//! depends on where it aborts:
//!
//! | aborted while      | quota slot | artifact      |
//! |--------------------|------------|---------------|
//! | verifying          | untouched  | none          |
//! | reserving          | untouched  | none          |
//! | saving             | consumed   | none          |
//! | inferring          | consumed   | deleted       |
//! | recording          | consumed   | kept          |
//!
//! The quota slot is never refunded, and an artifact whose scan record failed
//! to write is kept for later reconciliation. A user may therefore be charged
//! for a scan that has no record; this window is accepted.

use crate::auth::{AuthError, IdentityVerifier, Subject};
use crate::error::{Error, Result};
use crate::event::{ScanEvent, ScanEventsSender};
use crate::inference::{FallbackOrchestrator, ImagePayload};
use crate::quota::{QuotaError, QuotaLedger};
use crate::scans::{NewScan, ScanRepository};
use crate::storage::{artifact_path, ArtifactStore, StorageRef, UploadedArtifact, Visibility};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

/// Pipeline stage a request has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing verified yet.
    Unauthenticated,
    /// Caller verified and a quota slot reserved.
    QuotaChecked,
    /// Upload written to the artifact store.
    Uploaded,
    /// A backend described the image.
    Inferred,
    /// Scan record committed.
    Recorded,
    /// Response produced.
    Responded,
}

/// Everything the pipeline needs from one inbound request.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Raw bearer token from the header or session cookie.
    pub credential: Option<String>,
    /// The `image` part, if present.
    pub upload: Option<UploadedArtifact>,
}

/// Result of a completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Identifier of the new scan record.
    pub scan_id: String,
    /// Generated description.
    pub analysis: String,
    /// Backend that produced the description.
    pub backend: String,
    /// Where the upload was stored.
    pub storage_reference: StorageRef,
    /// The caller's usage count after this scan.
    pub usage_count: u64,
}

/// Per-request state threaded through the stages.
struct ScanContext {
    stage: Stage,
    subject: Option<Subject>,
    artifact: Option<StorageRef>,
}

impl ScanContext {
    const fn new() -> Self {
        Self {
            stage: Stage::Unauthenticated,
            subject: None,
            artifact: None,
        }
    }

    fn advance(&mut self, stage: Stage) {
        debug!("Scan {:?} -> {stage:?}", self.stage);
        self.stage = stage;
    }
}

/// Sequences verification, quota, storage, inference and persistence for
/// one request.
pub struct ScanPipeline {
    verifier: Arc<dyn IdentityVerifier>,
    ledger: Arc<dyn QuotaLedger>,
    store: Arc<dyn ArtifactStore>,
    orchestrator: Arc<FallbackOrchestrator>,
    scans: Arc<dyn ScanRepository>,
    instruction: String,
    events: Option<ScanEventsSender>,
}

impl ScanPipeline {
    /// Wire a pipeline from its collaborators.
    #[must_use]
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        ledger: Arc<dyn QuotaLedger>,
        store: Arc<dyn ArtifactStore>,
        orchestrator: Arc<FallbackOrchestrator>,
        scans: Arc<dyn ScanRepository>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            ledger,
            store,
            orchestrator,
            scans,
            instruction: instruction.into(),
            events: None,
        }
    }

    /// Publish stage transitions on `events`.
    #[must_use]
    pub fn with_events(mut self, events: ScanEventsSender) -> Self {
        self.events = Some(events);
        self
    }

    /// The inference orchestrator, for stats.
    #[must_use]
    pub fn orchestrator(&self) -> &FallbackOrchestrator {
        &self.orchestrator
    }

    /// Run one request to completion.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the request. Side effects of earlier
    /// stages are handled as described in the module docs.
    pub async fn run(&self, request: ScanRequest) -> Result<ScanOutcome> {
        let subject = self.authenticate(request.credential).await?;
        self.run_authenticated(subject, request.upload).await
    }

    /// Verify the caller. Nothing else is touched when this fails, so the
    /// HTTP layer calls it before reading the request body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the credential is missing or rejected.
    pub async fn authenticate(&self, credential: Option<String>) -> Result<Subject> {
        let verified = match credential.filter(|credential| !credential.trim().is_empty()) {
            Some(credential) => self.verifier.verify(&credential).await,
            None => Err(AuthError::MissingCredential),
        };

        match verified {
            Ok(subject) => {
                self.emit(ScanEvent::Authenticated {
                    subject_id: subject.id.clone(),
                    anonymous: subject.is_anonymous,
                });
                Ok(subject)
            }
            Err(e) => {
                let e = Error::from(e);
                self.report_abort(&ScanContext::new(), &e);
                Err(e)
            }
        }
    }

    /// Run the remaining stages for a caller that [`Self::authenticate`]
    /// already verified.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the request.
    pub async fn run_authenticated(
        &self,
        subject: Subject,
        upload: Option<UploadedArtifact>,
    ) -> Result<ScanOutcome> {
        let mut ctx = ScanContext::new();
        let result = self.execute(&mut ctx, subject, upload).await;

        match &result {
            Ok(outcome) => {
                ctx.advance(Stage::Responded);
                info!(
                    "Scan {} complete via {} (usage {})",
                    outcome.scan_id, outcome.backend, outcome.usage_count
                );
            }
            Err(e) => self.report_abort(&ctx, e),
        }
        result
    }

    fn report_abort(&self, ctx: &ScanContext, err: &Error) {
        let subject = ctx.subject.as_ref().map_or("-", |s| s.id.as_str());
        if abort_level(err) == Level::WARN {
            warn!("Scan for {subject} aborted at {:?}: {err}", ctx.stage);
        } else {
            info!("Scan for {subject} aborted at {:?}: {err}", ctx.stage);
        }
        if let Some(reference) = &ctx.artifact {
            debug!("Artifact {reference} retained after abort");
        }
        self.emit(ScanEvent::Aborted {
            reason: err.to_string(),
        });
    }

    async fn execute(
        &self,
        ctx: &mut ScanContext,
        subject: Subject,
        upload: Option<UploadedArtifact>,
    ) -> Result<ScanOutcome> {
        ctx.subject = Some(subject.clone());

        // Checked before reserving so malformed requests are not charged.
        let upload = upload
            .filter(|upload| !upload.bytes.is_empty())
            .ok_or(Error::MissingImage)?;

        let reservation = match self.ledger.reserve(&subject).await {
            Ok(reservation) => reservation,
            Err(e) => {
                if let QuotaError::Exceeded { limit, used, .. } = &e {
                    self.emit(ScanEvent::QuotaRejected {
                        subject_id: subject.id.clone(),
                        limit: *limit,
                        used: *used,
                    });
                }
                return Err(e.into());
            }
        };
        self.emit(ScanEvent::QuotaReserved {
            subject_id: subject.id.clone(),
            count: reservation.new_count,
        });
        ctx.advance(Stage::QuotaChecked);

        let path = artifact_path(
            &subject,
            Utc::now().timestamp_millis(),
            &upload.original_filename,
        );
        let reference = self
            .store
            .save(&path, upload.bytes.clone(), &upload.mime_type)
            .await?;
        self.emit(ScanEvent::ArtifactStored {
            reference: reference.to_string(),
        });
        ctx.artifact = Some(reference.clone());
        ctx.advance(Stage::Uploaded);

        let image = ImagePayload {
            bytes: upload.bytes,
            mime_type: upload.mime_type,
        };
        let inference = match self.orchestrator.infer(&self.instruction, &image).await {
            Ok(inference) => inference,
            Err(e) => {
                self.discard_artifact(&reference).await;
                ctx.artifact = None;
                return Err(e.into());
            }
        };
        self.emit(ScanEvent::InferenceSucceeded {
            backend: inference.backend.clone(),
        });
        ctx.advance(Stage::Inferred);

        // A failed write keeps the artifact and the consumed quota slot.
        let scan_id = self
            .scans
            .persist(NewScan {
                owner_id: subject.id.clone(),
                storage_reference: reference.clone(),
                result_text: inference.text.clone(),
                backend_used: inference.backend.clone(),
                visibility: Visibility::for_subject(&subject),
            })
            .await?;
        self.emit(ScanEvent::ScanRecorded {
            scan_id: scan_id.clone(),
        });
        ctx.advance(Stage::Recorded);

        Ok(ScanOutcome {
            scan_id,
            analysis: inference.text,
            backend: inference.backend,
            storage_reference: reference,
            usage_count: reservation.new_count,
        })
    }

    /// Best-effort delete; failures are logged and reported, never returned.
    async fn discard_artifact(&self, reference: &StorageRef) {
        match self.store.delete(reference).await {
            Ok(()) => debug!("Deleted artifact {reference} after failed inference"),
            Err(e) => {
                warn!("Failed to delete artifact {reference}: {e}");
                self.emit(ScanEvent::ArtifactCleanupFailed {
                    reference: reference.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: ScanEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Rejections of the caller are routine; failures of our own collaborators
/// after the caller was charged are not.
fn abort_level(err: &Error) -> Level {
    match err {
        Error::Storage(_) | Error::Inference(_) | Error::Persistence(_) => Level::WARN,
        _ => Level::INFO,
    }
}
