//! # Intent Module
//!
//! The offline intent: what it contains, how it is signed, and how nonces
//! keep it from being replayed.
//!
//! ## Lifecycle
//!
//! ```text
//! IntentCodec::create ──► Pending ──► exchange / store ──► reconcile
//!        ▲                                                    │
//!   NonceLedger::issue                      Settled | Failed | Rejected | Expired
//! ```

pub mod codec;
pub mod confidential;
pub mod nonce;
pub mod types;

pub use codec::{canonical_bytes, IntentCodec, Verification, VerifyFailure};
pub use confidential::{ConfidentialEncryptor, ConfidentialError};
pub use nonce::{IssuedNonce, NonceLedger, NonceRecord};
pub use types::{EncryptedPayload, Intent, IntentExtras, IntentStatus};
