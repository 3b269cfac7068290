//! # Error Taxonomy
//!
//! One top-level error for everything the engine surfaces to callers.
//! Component errors stay precise in their own modules and fold into
//! [`TossError`] through `From`, so `?` works across layers.
//!
//! The split matters for callers:
//!
//! - `Validation` and `Replay` are never retried. Replay is kept separate
//!   because it may point at a genuine double-submission rather than a
//!   corrupted intent.
//! - `Transport` carries the fragment indices that never made it, so a
//!   caller can resend just those.
//! - `Ledger` leaves the intent pending for a later pass.
//! - `Authorization` aborts before any state changes.
//! - `Storage` always propagates. Losing an intent silently is not an option.

use thiserror::Error;

use crate::crypto::{EncryptionError, HandshakeError, KeyError};
use crate::ledger::LedgerError;
use crate::storage::StorageError;
use crate::transport::{FragmentError, TransportError};

#[derive(Debug, Error)]
pub enum TossError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("replay rejected for {signer}: nonce {nonce} is not above {observed}")]
    Replay {
        signer: String,
        nonce: u64,
        observed: u64,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("authorization denied: {0}")]
    Authorization(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("reconciliation already running for {0}")]
    ReconciliationInProgress(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),
}

pub type TossResult<T> = Result<T, TossError>;

impl From<EncryptionError> for TossError {
    fn from(e: EncryptionError) -> Self {
        TossError::Crypto(e.to_string())
    }
}

impl From<HandshakeError> for TossError {
    fn from(e: HandshakeError) -> Self {
        TossError::Crypto(e.to_string())
    }
}

impl From<KeyError> for TossError {
    fn from(e: KeyError) -> Self {
        TossError::Crypto(e.to_string())
    }
}

impl From<bincode::Error> for TossError {
    fn from(e: bincode::Error) -> Self {
        TossError::Serialization(e.to_string())
    }
}
