//! Ingester: pluggable stream processors with dedup/resend semantics,
//! catalogue enrichment, error tracking and pending-entry retry.

pub mod config;
pub mod enrichment;
pub mod error_ingestion;
pub mod orchestrator;
pub mod processor;
pub mod processors;
