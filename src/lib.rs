//! # foodsense
//!
//! Quota-metered image analysis service.
//!
//! A mobile client uploads a photo (typically a food label or a plate) with a
//! bearer credential. The service verifies the credential, reserves one scan
//! against the caller's monthly quota, stores the upload, asks a prioritised
//! list of AI backends for a description and records the result.
//!
//! ## Request flow
//!
//! ```text
//! POST /analyze-image (multipart, field "image")
//!        │
//!        ▼
//! ┌─────────────────────┐   fail   ┌──────────────┐
//! │ Verify credential   │ ───────► │ 401 / 403    │
//! └─────────┬───────────┘          └──────────────┘
//!           ▼
//! ┌─────────────────────┐   full   ┌──────────────┐
//! │ Reserve quota slot  │ ───────► │ 403          │
//! └─────────┬───────────┘          └──────────────┘
//!           ▼
//! ┌─────────────────────┐   fail   ┌──────────────┐
//! │ Store artifact      │ ───────► │ 500          │
//! └─────────┬───────────┘          └──────────────┘
//!           ▼
//! ┌─────────────────────┐   fail   ┌──────────────────────────┐
//! │ Backend A → B → C   │ ───────► │ delete artifact, 500     │
//! └─────────┬───────────┘          └──────────────────────────┘
//!           ▼
//! ┌─────────────────────┐   fail   ┌──────────────────────────┐
//! │ Persist scan record │ ───────► │ keep artifact, 500       │
//! └─────────┬───────────┘          └──────────────────────────┘
//!           ▼
//!          200
//! ```
//!
//! Quota is never refunded once reserved; see [`pipeline`] for the
//! accepted inconsistency window.

pub mod auth;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod inference;
pub mod pipeline;
pub mod quota;
pub mod scans;
pub mod server;
pub mod storage;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use event::{ScanEvent, ScanEventsChannel, ScanEventsSender};
pub use pipeline::{ScanOutcome, ScanPipeline, ScanRequest};
pub use server::{RunningServer, ServerBuilder, ShutdownHandle};
