//! # Cryptographic Primitives
//!
//! Thin, typed wrappers over audited implementations:
//!
//! - **Ed25519** (`keys`) for intent signatures and device identity.
//! - **AES-256-GCM** (`encryption`) for sealing exchange payloads.
//! - **X25519 + BLAKE3 KDF** (`handshake`) for transport session keys.
//!
//! Nothing in here is hand-rolled.

pub mod encryption;
pub mod handshake;
pub mod keys;

pub use encryption::{open, seal, EncryptionError};
pub use handshake::{AgreedKey, HandshakeError, SessionHandshake, SessionHello};
pub use keys::{DeviceKeypair, KeyError, PublicKey, Signature};
