//! The proof-job gateway: accepts game replay tapes, drives the external
//! GPU prover through submission and polling under single-flight semantics,
//! persists proof artifacts, and relays on-chain settlement claims.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod pipeline;
pub mod queue;
pub mod relay;
pub mod server;
