//! Collaborators for a node that ships with no chain client and no radio.
//!
//! The engine talks to the ledger and the short-range link through traits.
//! A standalone node has neither, so it runs with a ledger that is always
//! unreachable and a link that reaches nobody. Intents are still signed,
//! stored and swept; reconciliation simply reports the ledger as down until
//! an embedder wires in a real client.

use async_trait::async_trait;

use toss_protocol::crypto::PublicKey;
use toss_protocol::intent::Intent;
use toss_protocol::ledger::{AccountState, LedgerClient, LedgerError, LedgerRef, NonceAccountState};
use toss_protocol::transport::{TransportAdapter, TransportIoError};

const NO_LEDGER: &str = "no ledger client configured";

/// A ledger that is never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedLedger;

#[async_trait]
impl LedgerClient for DisconnectedLedger {
    async fn get_account_state(&self, _signer: &PublicKey) -> Result<AccountState, LedgerError> {
        Err(LedgerError::Unavailable(NO_LEDGER.into()))
    }

    async fn get_recent_checkpoint(&self) -> Result<u64, LedgerError> {
        Err(LedgerError::Unavailable(NO_LEDGER.into()))
    }

    async fn build_and_submit(&self, _intent: &Intent) -> Result<LedgerRef, LedgerError> {
        Err(LedgerError::Unavailable(NO_LEDGER.into()))
    }

    async fn confirm(&self, _reference: &LedgerRef) -> Result<bool, LedgerError> {
        Err(LedgerError::Unavailable(NO_LEDGER.into()))
    }

    async fn get_nonce_account(
        &self,
        _address: &PublicKey,
    ) -> Result<Option<NonceAccountState>, LedgerError> {
        Err(LedgerError::Unavailable(NO_LEDGER.into()))
    }

    async fn create_nonce_account(
        &self,
        _owner: &PublicKey,
        _authority: &PublicKey,
    ) -> Result<NonceAccountState, LedgerError> {
        Err(LedgerError::Unavailable(NO_LEDGER.into()))
    }
}

/// A link with no peers in range.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRadio;

#[async_trait]
impl TransportAdapter for NoRadio {
    async fn send(&self, peer_id: &str, _bytes: &[u8]) -> Result<(), TransportIoError> {
        Err(TransportIoError::Unreachable(peer_id.to_string()))
    }
}
