//! Typed HTTP client for the external GPU prover.
//!
//! The gateway never generates proofs itself; it drives the prover through
//! this surface: a cached, compatibility-gated health probe, single-flight
//! tape submission, and status polling with bounded per-invocation budgets.

pub mod client;
pub mod error;
pub mod health;
pub mod types;

pub use client::{ProverClient, ProverClientConfig};
pub use error::{ProverClientError, Result};
pub use health::{HealthCache, ValidatedHealth};
pub use types::{PollOutcome, ProverSuccess, SubmitAccepted, SubmitOutcome};
