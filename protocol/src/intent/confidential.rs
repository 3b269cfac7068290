//! Confidential-compute encryptor seam.
//!
//! Some deployments attach an encrypted payload to an intent, produced by an
//! external confidential-computation service. The engine signs and carries
//! the ciphertext but never interprets it.

use async_trait::async_trait;
use thiserror::Error;

use super::types::EncryptedPayload;

#[derive(Debug, Error)]
#[error("confidential encryption failed: {0}")]
pub struct ConfidentialError(pub String);

#[async_trait]
pub trait ConfidentialEncryptor: Send + Sync {
    async fn encrypt(
        &self,
        program_ref: &str,
        values: &[u64],
    ) -> Result<EncryptedPayload, ConfidentialError>;
}
