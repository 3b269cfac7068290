//! Message envelope.
//!
//! The first byte of every reassembled message says whether the rest is
//! plaintext or sealed under the sender's transport session:
//!
//! ```text
//! 0x00 ‖ body              plaintext
//! 0x01 ‖ nonce ‖ ct ‖ tag  AES-256-GCM under the session key
//! ```

use super::session::{SessionManager, TransportSession};
use super::TransportError;
use crate::config::{ENVELOPE_PLAINTEXT, ENVELOPE_SEALED};
use crate::crypto::EncryptionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Plain(Vec<u8>),
    Sealed(Vec<u8>),
}

impl Envelope {
    pub fn plain(body: Vec<u8>) -> Self {
        Envelope::Plain(body)
    }

    pub fn seal(session: &TransportSession, body: &[u8]) -> Result<Self, EncryptionError> {
        Ok(Envelope::Sealed(session.seal(body)?))
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Envelope::Sealed(_))
    }

    pub fn encode(&self) -> Vec<u8> {
        let (flag, body) = match self {
            Envelope::Plain(b) => (ENVELOPE_PLAINTEXT, b),
            Envelope::Sealed(b) => (ENVELOPE_SEALED, b),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(flag);
        out.extend_from_slice(body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        match bytes.split_first() {
            Some((&ENVELOPE_PLAINTEXT, body)) => Ok(Envelope::Plain(body.to_vec())),
            Some((&ENVELOPE_SEALED, body)) => Ok(Envelope::Sealed(body.to_vec())),
            Some((flag, _)) => Err(TransportError::BadEnvelope(format!(
                "unknown flag {:#04x}",
                flag
            ))),
            None => Err(TransportError::BadEnvelope("empty message".into())),
        }
    }

    /// Plaintext body, opening with `peer_id`'s live session when sealed.
    pub fn open(self, sessions: &SessionManager, peer_id: &str) -> Result<Vec<u8>, TransportError> {
        match self {
            Envelope::Plain(body) => Ok(body),
            Envelope::Sealed(sealed) => {
                let session = sessions
                    .get_secure_session(peer_id)
                    .ok_or_else(|| TransportError::NoSession(peer_id.to_string()))?;
                Ok(session.open(&sealed)?)
            }
        }
    }
}
