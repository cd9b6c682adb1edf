//! Budget module - metered resource ledger and failure retry policy.
//!
//! # Key Concepts
//! - Ledger: per-resource limit/usage with suspension and fallback substitution
//! - Retry: failure bookkeeping on tasks and backoff for re-notification

mod ledger;
mod retry;

pub use ledger::{
    validate_amount, validate_fallback_chain, ChargeOutcome, ChargeRecord, ChargeResult,
    NewResource, ResourceEntry, ResourceStatus, MAX_FALLBACK_DEPTH,
};
pub use retry::{BackoffPolicy, FailureDisposition};
