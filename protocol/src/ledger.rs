//! # Ledger Client Seam
//!
//! The engine never talks to a chain directly. Everything it needs from the
//! authoritative ledger goes through [`LedgerClient`]: account balances and
//! observed nonces, a recent checkpoint, submission and confirmation of a
//! settlement, and durable nonce accounts.
//!
//! Implementations live outside this crate (an RPC client for a real chain,
//! or a fake in tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::crypto::keys::PublicKey;
use crate::intent::Intent;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unavailable(String),

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// What the ledger currently knows about a signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: u64,
    /// Highest nonce the ledger has seen settled for this signer.
    pub observed_nonce: u64,
}

/// Ledger-side view of a durable nonce account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceAccountState {
    pub address: PublicKey,
    pub authority: PublicKey,
    pub nonce: u64,
    /// Base58 id of the program that owns the account.
    pub owner_program: String,
}

/// Reference to a submitted settlement, usually a transaction signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerRef(pub String);

impl fmt::Display for LedgerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_account_state(&self, signer: &PublicKey) -> Result<AccountState, LedgerError>;

    /// Opaque slot or height, recorded in reconciliation state.
    async fn get_recent_checkpoint(&self) -> Result<u64, LedgerError>;

    /// Build a ledger transaction from `intent` and submit it.
    async fn build_and_submit(&self, intent: &Intent) -> Result<LedgerRef, LedgerError>;

    async fn confirm(&self, reference: &LedgerRef) -> Result<bool, LedgerError>;

    async fn get_nonce_account(
        &self,
        address: &PublicKey,
    ) -> Result<Option<NonceAccountState>, LedgerError>;

    async fn create_nonce_account(
        &self,
        owner: &PublicKey,
        authority: &PublicKey,
    ) -> Result<NonceAccountState, LedgerError>;
}
