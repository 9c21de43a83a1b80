//! Scan pipeline event system.

use tokio::sync::broadcast;

/// Events emitted while a scan request moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Credential verified.
    Authenticated {
        /// Subject identifier.
        subject_id: String,
        /// Whether the subject signed in anonymously.
        anonymous: bool,
    },

    /// A quota slot was reserved.
    QuotaReserved {
        /// Subject identifier.
        subject_id: String,
        /// Usage count after the reservation.
        count: u64,
    },

    /// The subject has no quota left this month.
    QuotaRejected {
        /// Subject identifier.
        subject_id: String,
        /// Tier limit.
        limit: u64,
        /// Scans already used.
        used: u64,
    },

    /// Upload written to the artifact store.
    ArtifactStored {
        /// Storage reference.
        reference: String,
    },

    /// One backend attempt failed; the next one will be tried.
    BackendFailed {
        /// Backend name.
        backend: String,
        /// Failure message.
        message: String,
    },

    /// A backend produced a description.
    InferenceSucceeded {
        /// Backend name.
        backend: String,
    },

    /// Scan record committed.
    ScanRecorded {
        /// Scan identifier.
        scan_id: String,
    },

    /// Best-effort artifact cleanup failed.
    ArtifactCleanupFailed {
        /// Storage reference left behind.
        reference: String,
    },

    /// Request aborted.
    Aborted {
        /// Client-facing reason.
        reason: String,
    },
}

/// Channel for receiving scan events.
pub type ScanEventsChannel = broadcast::Receiver<ScanEvent>;

/// Sender for scan events.
pub type ScanEventsSender = broadcast::Sender<ScanEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (ScanEventsSender, ScanEventsChannel) {
    broadcast::channel(256)
}
