//! End-to-end tests for foodsense.
//!
//! The tests drive the scan pipeline and the HTTP surface with real token
//! verification and in-memory collaborators. Redis-backed variants live next
//! to the Redis code and are ignored unless a server is available.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod harness;
mod http_tests;
mod pipeline_tests;
