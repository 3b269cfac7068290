//! # Reconcile Module
//!
//! Settling stored intents against the ledger once a device is back online:
//! deterministic conflict resolution ([`conflict`]), the per-signer pass
//! ([`ReconciliationEngine`]) and what it records ([`state`]).

pub mod conflict;
pub mod engine;
pub mod state;

pub use conflict::{group_conflicts, precedence, resolve, ConflictKey, Resolution};
pub use engine::{PassLocks, ReconciliationEngine};
pub use state::{
    ConflictOutcome, ReconciliationReport, ReconciliationState, RejectionReason,
    SettlementResult, SettlementStatus,
};
