//! Settlement results and per-signer reconciliation state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::conflict::ConflictKey;
use crate::config::SUPERSEDED_REASON;
use crate::crypto::keys::PublicKey;
use crate::intent::VerifyFailure;
use crate::ledger::LedgerRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementStatus {
    Success,
    /// Ledger trouble; the intent is retried on a later pass.
    Failed,
    /// Definitive. The intent will never settle.
    Rejected,
}

/// Why an intent was rejected. Each one maps to a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    Expired,
    Invalid(VerifyFailure),
    Replay { nonce: u64, observed: u64 },
    InsufficientBalance { required: u64, available: u64 },
    NonceAccountMissing,
    NonceAccountWrongOwner { owner: String },
    NonceAccountAuthorityMismatch,
    NonceAccountInactive,
    Superseded { winner: String },
}

impl RejectionReason {
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay { .. })
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Invalid(why) => write!(f, "invalid: {}", why),
            Self::Replay { nonce, observed } => {
                write!(f, "replay: nonce {} not above ledger nonce {}", nonce, observed)
            }
            Self::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient balance: need {}, have {}",
                required, available
            ),
            Self::NonceAccountMissing => write!(f, "nonce account not found"),
            Self::NonceAccountWrongOwner { owner } => {
                write!(f, "nonce account owned by {}, not the system program", owner)
            }
            Self::NonceAccountAuthorityMismatch => {
                write!(f, "nonce account authority does not match sender")
            }
            Self::NonceAccountInactive => write!(f, "nonce account inactive or expired"),
            Self::Superseded { winner } => write!(f, "{} (winner {})", SUPERSEDED_REASON, winner),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub intent_id: String,
    pub status: SettlementStatus,
    pub ledger_ref: Option<LedgerRef>,
    pub reason: Option<RejectionReason>,
    /// Ledger error text for `Failed` results.
    pub error: Option<String>,
    pub timestamp: u64,
}

impl SettlementResult {
    pub fn success(intent_id: &str, ledger_ref: LedgerRef, now: u64) -> Self {
        Self {
            intent_id: intent_id.to_string(),
            status: SettlementStatus::Success,
            ledger_ref: Some(ledger_ref),
            reason: None,
            error: None,
            timestamp: now,
        }
    }

    pub fn rejected(intent_id: &str, reason: RejectionReason, now: u64) -> Self {
        Self {
            intent_id: intent_id.to_string(),
            status: SettlementStatus::Rejected,
            ledger_ref: None,
            reason: Some(reason),
            error: None,
            timestamp: now,
        }
    }

    pub fn failed(intent_id: &str, error: String, ledger_ref: Option<LedgerRef>, now: u64) -> Self {
        Self {
            intent_id: intent_id.to_string(),
            status: SettlementStatus::Failed,
            ledger_ref,
            reason: None,
            error: Some(error),
            timestamp: now,
        }
    }

    /// One-line explanation for the intent's status.
    pub fn describe(&self) -> Option<String> {
        self.reason
            .as_ref()
            .map(|r| r.to_string())
            .or_else(|| self.error.clone())
    }
}

/// Per-signer progress across reconciliation passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub signer: PublicKey,
    pub last_sync_time: u64,
    pub last_sync_checkpoint: u64,
    pub processed_intents: BTreeSet<String>,
    pub failed_intents: BTreeSet<String>,
    pub conflicting_intents: BTreeSet<String>,
}

impl ReconciliationState {
    pub fn new(signer: PublicKey) -> Self {
        Self {
            signer,
            last_sync_time: 0,
            last_sync_checkpoint: 0,
            processed_intents: BTreeSet::new(),
            failed_intents: BTreeSet::new(),
            conflicting_intents: BTreeSet::new(),
        }
    }

    /// Fold one result in. A retry that later settles leaves the failed set.
    pub fn record(&mut self, result: &SettlementResult) {
        match result.status {
            SettlementStatus::Success | SettlementStatus::Rejected => {
                self.failed_intents.remove(&result.intent_id);
                self.processed_intents.insert(result.intent_id.clone());
            }
            SettlementStatus::Failed => {
                self.failed_intents.insert(result.intent_id.clone());
            }
        }
    }
}

/// One conflict group and how it was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictOutcome {
    pub key: ConflictKey,
    pub winner: String,
    pub losers: Vec<String>,
}

/// What a single reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub signer: PublicKey,
    pub checkpoint: u64,
    pub results: Vec<SettlementResult>,
    pub conflicts: Vec<ConflictOutcome>,
}

impl ReconciliationReport {
    pub fn result_for(&self, intent_id: &str) -> Option<&SettlementResult> {
        self.results.iter().find(|r| r.intent_id == intent_id)
    }

    pub fn count(&self, status: SettlementStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}
