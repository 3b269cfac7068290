//! Core type definitions for offline intents.
//!
//! An [`Intent`] is the unit everything else moves around: it is signed on
//! the sender's device, carried between peers, stored, and eventually
//! settled or rejected by reconciliation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::keys::{PublicKey, Signature};

// ---------------------------------------------------------------------------
// IntentStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an intent.
///
/// ```text
///             ┌──► Expired   (local clock)
///  Pending ───┼──► Rejected  (local or ledger validation)
///    ▲   │    └──► Settled   (ledger confirmed)
///    │   ▼
///    └─ Failed               (submission failed, retried next pass)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentStatus {
    Pending,
    Settled,
    /// The ledger refused or never confirmed it. Picked up again by the next
    /// reconciliation pass.
    Failed,
    Rejected,
    Expired,
}

impl IntentStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Rejected | Self::Expired)
    }

    /// States a reconciliation pass should pick up.
    pub fn is_settleable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Settled => write!(f, "Settled"),
            Self::Failed => write!(f, "Failed"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Expired => write!(f, "Expired"),
        }
    }
}

// ---------------------------------------------------------------------------
// EncryptedPayload
// ---------------------------------------------------------------------------

/// Opaque output of a confidential-compute encryptor. The engine signs it
/// and carries it; it never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub program_ref: String,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// A signed declaration of an offline payment.
///
/// The signature covers [`canonical_bytes`](super::codec::canonical_bytes):
/// every field except `signature` and the local bookkeeping fields
/// (`status`, `status_reason`, `updated_at`, `replay_unverified`), which
/// change as the intent moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Canonical schema version the signature was produced under.
    pub version: u8,
    pub id: String,
    pub sender: PublicKey,
    pub recipient: PublicKey,
    /// Amount in the smallest unit.
    pub amount: u64,
    pub nonce: u64,
    /// Unix seconds. The intent is dead at `expiry` and after.
    pub expiry: u64,
    pub created_at: u64,
    pub nonce_account_ref: Option<PublicKey>,
    pub encrypted_payload: Option<EncryptedPayload>,
    pub signature: Signature,

    // -- local bookkeeping, not signed --
    pub status: IntentStatus,
    /// Human-readable reason for the current status, set on every terminal
    /// transition and on failures.
    pub status_reason: Option<String>,
    pub updated_at: u64,
    /// The nonce was issued without a fresh ledger reading; reconciliation
    /// re-checks it.
    pub replay_unverified: bool,
}

impl Intent {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiry <= now
    }

    /// Move to `status`. Terminal intents stay as they are and `false` is
    /// returned.
    pub fn transition(&mut self, status: IntentStatus, reason: Option<String>, now: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.status_reason = reason;
        self.updated_at = now;
        true
    }

    /// Whether `other` carries the same signed fields and signature. Local
    /// bookkeeping is ignored.
    pub fn same_signed_content(&self, other: &Intent) -> bool {
        self.version == other.version
            && self.id == other.id
            && self.sender == other.sender
            && self.recipient == other.recipient
            && self.amount == other.amount
            && self.nonce == other.nonce
            && self.expiry == other.expiry
            && self.created_at == other.created_at
            && self.nonce_account_ref == other.nonce_account_ref
            && self.encrypted_payload == other.encrypted_payload
            && self.signature == other.signature
    }

    /// Short id prefix for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// Optional fields supplied at creation.
#[derive(Debug, Clone, Default)]
pub struct IntentExtras {
    pub nonce_account_ref: Option<PublicKey>,
    pub encrypted_payload: Option<EncryptedPayload>,
    /// Override the generated id. Tests and imports only.
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(IntentStatus::Settled.is_terminal());
        assert!(IntentStatus::Rejected.is_terminal());
        assert!(IntentStatus::Expired.is_terminal());
        assert!(!IntentStatus::Pending.is_terminal());
        assert!(!IntentStatus::Failed.is_terminal());
    }

    #[test]
    fn failed_is_settleable_again() {
        assert!(IntentStatus::Failed.is_settleable());
        assert!(!IntentStatus::Settled.is_settleable());
    }
}
