//! # IntentCodec
//!
//! Canonical serialization, signing and verification of intents.
//!
//! ## Canonical layout (schema v1)
//!
//! All integers are big-endian and fixed-width. Field order is frozen; a
//! new field means a new schema version.
//!
//! ```text
//! "TOSS-INTENT"            domain tag (11 bytes)
//! version            u8
//! id_len             u16   id bytes (UTF-8)
//! sender             [u8; 32]
//! recipient          [u8; 32]
//! amount             u64
//! nonce              u64
//! expiry             u64
//! created_at         u64
//! nonce_account_ref  u8 tag (0 = none, 1 = some) [+ 32 bytes]
//! encrypted_payload  u8 tag [+ u16 ref_len, ref, u32 data_len, data]
//! ```
//!
//! Anything that can be rebuilt byte-for-byte from these rules verifies the
//! same on every device, whatever it is written in.
//!
//! Verification never errors. It answers with a [`Verification`] carrying a
//! reason code for diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::types::{Intent, IntentExtras, IntentStatus};
use crate::clock::SharedClock;
use crate::config::{INTENT_DOMAIN_TAG, INTENT_SCHEMA_VERSION};
use crate::crypto::keys::{DeviceKeypair, PublicKey, Signature};
use crate::error::{TossError, TossResult};

/// Longest intent id accepted. UUIDs are 36 characters.
pub const MAX_INTENT_ID_LEN: usize = 128;

/// Longest confidential program reference accepted.
pub const MAX_PROGRAM_REF_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Verification result
// ---------------------------------------------------------------------------

/// Why an intent failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerifyFailure {
    UnsupportedVersion(u8),
    EmptyId,
    IdTooLong,
    ZeroAmount,
    ExpiryNotAfterCreation,
    PayloadTooLarge,
    MalformedSignature,
    BadSignature,
    Expired,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported schema version {}", v),
            Self::EmptyId => write!(f, "empty intent id"),
            Self::IdTooLong => write!(f, "intent id too long"),
            Self::ZeroAmount => write!(f, "amount must be positive"),
            Self::ExpiryNotAfterCreation => write!(f, "expiry must be after creation"),
            Self::PayloadTooLarge => write!(f, "encrypted payload too large"),
            Self::MalformedSignature => write!(f, "malformed signature"),
            Self::BadSignature => write!(f, "signature does not verify"),
            Self::Expired => write!(f, "intent expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<VerifyFailure>,
}

impl Verification {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn fail(reason: VerifyFailure) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical bytes
// ---------------------------------------------------------------------------

/// The exact bytes an intent signature covers.
pub fn canonical_bytes(intent: &Intent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INTENT_DOMAIN_TAG.len() + 160 + intent.id.len());
    buf.extend_from_slice(INTENT_DOMAIN_TAG);
    buf.push(intent.version);

    let id = intent.id.as_bytes();
    buf.extend_from_slice(&(id.len().min(u16::MAX as usize) as u16).to_be_bytes());
    buf.extend_from_slice(&id[..id.len().min(u16::MAX as usize)]);

    buf.extend_from_slice(intent.sender.as_bytes());
    buf.extend_from_slice(intent.recipient.as_bytes());
    buf.extend_from_slice(&intent.amount.to_be_bytes());
    buf.extend_from_slice(&intent.nonce.to_be_bytes());
    buf.extend_from_slice(&intent.expiry.to_be_bytes());
    buf.extend_from_slice(&intent.created_at.to_be_bytes());

    match &intent.nonce_account_ref {
        None => buf.push(0),
        Some(account) => {
            buf.push(1);
            buf.extend_from_slice(account.as_bytes());
        }
    }

    match &intent.encrypted_payload {
        None => buf.push(0),
        Some(payload) => {
            buf.push(1);
            let program = payload.program_ref.as_bytes();
            buf.extend_from_slice(&(program.len() as u16).to_be_bytes());
            buf.extend_from_slice(program);
            buf.extend_from_slice(&(payload.data.len() as u32).to_be_bytes());
            buf.extend_from_slice(&payload.data);
        }
    }

    buf
}

/// Sign the canonical form of `intent` with `keys`.
pub fn sign(intent: &Intent, keys: &DeviceKeypair) -> Signature {
    keys.sign(&canonical_bytes(intent))
}

fn check_structure(intent: &Intent) -> Result<(), VerifyFailure> {
    if intent.version != INTENT_SCHEMA_VERSION {
        return Err(VerifyFailure::UnsupportedVersion(intent.version));
    }
    if intent.id.is_empty() {
        return Err(VerifyFailure::EmptyId);
    }
    if intent.id.len() > MAX_INTENT_ID_LEN {
        return Err(VerifyFailure::IdTooLong);
    }
    if intent.amount == 0 {
        return Err(VerifyFailure::ZeroAmount);
    }
    if intent.expiry <= intent.created_at {
        return Err(VerifyFailure::ExpiryNotAfterCreation);
    }
    if let Some(payload) = &intent.encrypted_payload {
        if payload.program_ref.len() > MAX_PROGRAM_REF_LEN || payload.data.len() > u32::MAX as usize
        {
            return Err(VerifyFailure::PayloadTooLarge);
        }
    }
    if !intent.signature.is_well_formed() {
        return Err(VerifyFailure::MalformedSignature);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// IntentCodec
// ---------------------------------------------------------------------------

/// Creates and checks intents against a clock.
#[derive(Clone)]
pub struct IntentCodec {
    clock: SharedClock,
}

impl IntentCodec {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Build and sign a new pending intent.
    pub fn create(
        &self,
        sender: &DeviceKeypair,
        recipient: PublicKey,
        amount: u64,
        nonce: u64,
        expiry: u64,
        extras: IntentExtras,
    ) -> TossResult<Intent> {
        let now = self.clock.now();
        if amount == 0 {
            return Err(TossError::Validation("amount must be positive".into()));
        }
        if expiry <= now {
            return Err(TossError::Validation(format!(
                "expiry {} is not in the future (now {})",
                expiry, now
            )));
        }

        let mut intent = Intent {
            version: INTENT_SCHEMA_VERSION,
            id: extras.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender: sender.public_key(),
            recipient,
            amount,
            nonce,
            expiry,
            created_at: now,
            nonce_account_ref: extras.nonce_account_ref,
            encrypted_payload: extras.encrypted_payload,
            signature: Signature::from_slice(&[]),
            status: IntentStatus::Pending,
            status_reason: None,
            updated_at: now,
            replay_unverified: false,
        };

        if let Err(reason) = check_structure_unsigned(&intent) {
            return Err(TossError::Validation(reason.to_string()));
        }

        intent.signature = sign(&intent, sender);
        Ok(intent)
    }

    /// Sign an intent in place with `keys`, which must belong to its sender.
    pub fn sign(&self, intent: &Intent, keys: &DeviceKeypair) -> Signature {
        sign(intent, keys)
    }

    /// Full check: structure, expiry against the clock, then signature.
    pub fn verify(&self, intent: &Intent) -> Verification {
        if let Err(reason) = check_structure(intent) {
            return Verification::fail(reason);
        }
        if intent.is_expired_at(self.clock.now()) {
            return Verification::fail(VerifyFailure::Expired);
        }
        self.check_signature(intent)
    }

    /// Structure and signature only. Reconciliation handles expiry itself so
    /// it can record a distinct status for it.
    pub fn verify_signature(&self, intent: &Intent) -> Verification {
        if let Err(reason) = check_structure(intent) {
            return Verification::fail(reason);
        }
        self.check_signature(intent)
    }

    fn check_signature(&self, intent: &Intent) -> Verification {
        if intent
            .sender
            .verify(&canonical_bytes(intent), &intent.signature)
        {
            Verification::ok()
        } else {
            Verification::fail(VerifyFailure::BadSignature)
        }
    }
}

/// Structure checks that don't involve the signature, for use before signing.
fn check_structure_unsigned(intent: &Intent) -> Result<(), VerifyFailure> {
    let mut unsigned = intent.clone();
    unsigned.signature = Signature::from_bytes([0u8; crate::config::SIGNATURE_LENGTH]);
    check_structure(&unsigned)
}
