//! # AES-256-GCM Sealing
//!
//! Authenticated encryption for exchange payloads travelling over a
//! transport session. Each sealed box is `nonce || ciphertext || tag`, with a
//! fresh random 96-bit nonce per message.
//!
//! The associated data binds a sealed box to its context; transport sessions
//! pass their session id, which both ends agree on.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{AES_NONCE_LENGTH, AES_TAG_LENGTH, SESSION_KEY_LENGTH};

/// Encryption failures. The decrypt side stays vague: "wrong key" and
/// "tampered ciphertext" look the same from outside.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("sealed box too short: need at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    TooShort,
}

/// Seal `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(
    key: &[u8; SESSION_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a box produced by [`seal`] with the same key and associated data.
pub fn open(
    key: &[u8; SESSION_KEY_LENGTH],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::TooShort);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}
