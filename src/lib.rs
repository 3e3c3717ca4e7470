//! stresswarden -- safety-gated orchestration of network stress tests.
//!
//! This crate drives a load-generation engine through a consent gate, a
//! single-writer session state machine, a dead man's switch keepalive and a
//! push-event ingestion loop, and keeps a persisted history of finished runs.

pub mod classify;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod keepalive;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod safety;
pub mod state;
pub mod storage;

pub use error::{ErrorKind, OrchestratorError};
pub use orchestrator::Orchestrator;
