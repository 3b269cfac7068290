//! Credential gate.
//!
//! A biometric prompt or hardware-backed confirmation that must succeed
//! before any nonce-account operation goes ahead. The engine only sees a
//! yes or a no.

use async_trait::async_trait;

#[async_trait]
pub trait CredentialGate: Send + Sync {
    /// Ask the user. `reason` is shown in the prompt.
    async fn authorize(&self, reason: &str) -> bool;
}

/// Fixed answer. Headless nodes and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate(pub bool);

#[async_trait]
impl CredentialGate for StaticGate {
    async fn authorize(&self, reason: &str) -> bool {
        tracing::debug!(reason, granted = self.0, "credential gate");
        self.0
    }
}
