//! # Session Key Agreement
//!
//! Two devices that meet over a short-range link agree on a transport
//! session key with one round trip of ephemeral X25519:
//!
//! ```text
//!   Initiator                                Responder
//!      │  SessionHello { eph_pk, device_pk, sig }  │
//!      ├──────────────────────────────────────────►│
//!      │  SessionHello { eph_pk, device_pk, sig }  │
//!      │◄──────────────────────────────────────────┤
//!      │                                           │
//!   key = BLAKE3-derive-key(ctx, DH || session_id || sorted(eph_a, eph_b))
//! ```
//!
//! Each hello is signed with the device's long-term Ed25519 key, so a peer
//! knows which identity it shares the key with. The ephemeral secret is
//! consumed on use; a finished handshake cannot be completed twice.
//!
//! The agreed key is installed into the session manager on both sides; from
//! then on exchange payloads are sealed with AES-256-GCM.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use super::keys::{DeviceKeypair, PublicKey, Signature};
use crate::config::SESSION_KEY_LENGTH;

const KDF_CONTEXT: &str = "toss v1 transport session key";
const HELLO_TAG: &[u8] = b"TOSS-HELLO-v1";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("hello signature does not verify")]
    InvalidSignature,

    #[error("session mismatch: expected {expected}, got {got}")]
    SessionMismatch { expected: String, got: String },

    #[error("handshake already completed")]
    AlreadyCompleted,
}

/// One side's handshake message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionHello {
    pub session_id: String,
    pub device_pubkey: PublicKey,
    pub ephemeral_pubkey: [u8; 32],
    pub signature: Signature,
}

impl SessionHello {
    fn signable(session_id: &str, ephemeral: &[u8; 32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HELLO_TAG.len() + session_id.len() + 32);
        buf.extend_from_slice(HELLO_TAG);
        buf.extend_from_slice(session_id.as_bytes());
        buf.extend_from_slice(ephemeral);
        buf
    }

    fn signed(keypair: &DeviceKeypair, session_id: String, ephemeral: [u8; 32]) -> Self {
        let signature = keypair.sign(&Self::signable(&session_id, &ephemeral));
        Self {
            session_id,
            device_pubkey: keypair.public_key(),
            ephemeral_pubkey: ephemeral,
            signature,
        }
    }

    fn verify(&self) -> Result<(), HandshakeError> {
        let msg = Self::signable(&self.session_id, &self.ephemeral_pubkey);
        if self.device_pubkey.verify(&msg, &self.signature) {
            Ok(())
        } else {
            Err(HandshakeError::InvalidSignature)
        }
    }
}

/// The result of a finished handshake, identical on both devices.
#[derive(Clone)]
pub struct AgreedKey {
    pub session_id: String,
    /// The long-term identity of the other device.
    pub peer: PublicKey,
    pub key: [u8; SESSION_KEY_LENGTH],
}

impl std::fmt::Debug for AgreedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgreedKey")
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Initiator-side handshake state.
pub struct SessionHandshake {
    session_id: String,
    secret: Option<EphemeralSecret>,
    public: [u8; 32],
}

impl SessionHandshake {
    /// Start a handshake; send the returned hello to the peer.
    pub fn initiate(keypair: &DeviceKeypair) -> (Self, SessionHello) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        let session_id = Uuid::new_v4().to_string();
        let hello = SessionHello::signed(keypair, session_id.clone(), public);
        (
            Self {
                session_id,
                secret: Some(secret),
                public,
            },
            hello,
        )
    }

    /// Answer an incoming hello. Returns the reply to send back and the
    /// agreed key for the responder.
    pub fn respond(
        hello: &SessionHello,
        keypair: &DeviceKeypair,
    ) -> Result<(SessionHello, AgreedKey), HandshakeError> {
        hello.verify()?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&X25519PublicKey::from(hello.ephemeral_pubkey));
        let key = derive_session_key(
            shared.as_bytes(),
            &hello.session_id,
            &public,
            &hello.ephemeral_pubkey,
        );

        let reply = SessionHello::signed(keypair, hello.session_id.clone(), public);
        Ok((
            reply,
            AgreedKey {
                session_id: hello.session_id.clone(),
                peer: hello.device_pubkey,
                key,
            },
        ))
    }

    /// Finish the handshake with the responder's reply.
    pub fn complete(&mut self, reply: &SessionHello) -> Result<AgreedKey, HandshakeError> {
        if reply.session_id != self.session_id {
            return Err(HandshakeError::SessionMismatch {
                expected: self.session_id.clone(),
                got: reply.session_id.clone(),
            });
        }
        reply.verify()?;

        let secret = self.secret.take().ok_or(HandshakeError::AlreadyCompleted)?;
        let shared = secret.diffie_hellman(&X25519PublicKey::from(reply.ephemeral_pubkey));
        let key = derive_session_key(
            shared.as_bytes(),
            &self.session_id,
            &self.public,
            &reply.ephemeral_pubkey,
        );

        Ok(AgreedKey {
            session_id: self.session_id.clone(),
            peer: reply.device_pubkey,
            key,
        })
    }
}

/// KDF over the raw DH output. Ephemeral keys are sorted so both sides feed
/// the same bytes regardless of role.
fn derive_session_key(
    shared: &[u8; 32],
    session_id: &str,
    ours: &[u8; 32],
    theirs: &[u8; 32],
) -> [u8; SESSION_KEY_LENGTH] {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT);
    hasher.update(shared);
    hasher.update(session_id.as_bytes());
    let (first, second) = if ours <= theirs {
        (ours, theirs)
    } else {
        (theirs, ours)
    };
    hasher.update(first);
    hasher.update(second);

    let mut key = [0u8; SESSION_KEY_LENGTH];
    hasher.finalize_xof().fill(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_on_key() {
        let alice = DeviceKeypair::generate();
        let bob = DeviceKeypair::generate();

        let (mut pending, hello) = SessionHandshake::initiate(&alice);
        let (reply, bob_key) = SessionHandshake::respond(&hello, &bob).unwrap();
        let alice_key = pending.complete(&reply).unwrap();

        assert_eq!(alice_key.key, bob_key.key);
        assert_eq!(alice_key.session_id, bob_key.session_id);
        assert_eq!(alice_key.peer, bob.public_key());
        assert_eq!(bob_key.peer, alice.public_key());
    }

    #[test]
    fn forged_hello_rejected() {
        let alice = DeviceKeypair::generate();
        let mallory = DeviceKeypair::generate();
        let (_pending, mut hello) = SessionHandshake::initiate(&alice);
        hello.device_pubkey = mallory.public_key();

        let result = SessionHandshake::respond(&hello, &DeviceKeypair::generate());
        assert!(matches!(result, Err(HandshakeError::InvalidSignature)));
    }

    #[test]
    fn complete_twice_fails() {
        let alice = DeviceKeypair::generate();
        let bob = DeviceKeypair::generate();
        let (mut pending, hello) = SessionHandshake::initiate(&alice);
        let (reply, _) = SessionHandshake::respond(&hello, &bob).unwrap();

        pending.complete(&reply).unwrap();
        assert!(matches!(
            pending.complete(&reply),
            Err(HandshakeError::AlreadyCompleted)
        ));
    }

    #[test]
    fn reply_for_other_session_rejected() {
        let alice = DeviceKeypair::generate();
        let bob = DeviceKeypair::generate();
        let (mut pending, _hello) = SessionHandshake::initiate(&alice);
        let (_other, other_hello) = SessionHandshake::initiate(&alice);
        let (reply, _) = SessionHandshake::respond(&other_hello, &bob).unwrap();

        assert!(matches!(
            pending.complete(&reply),
            Err(HandshakeError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn agreed_key_debug_redacts_key() {
        let alice = DeviceKeypair::generate();
        let bob = DeviceKeypair::generate();
        let (_p, hello) = SessionHandshake::initiate(&alice);
        let (_r, agreed) = SessionHandshake::respond(&hello, &bob).unwrap();
        let dbg = format!("{:?}", agreed);
        assert!(!dbg.contains(&hex::encode(agreed.key)));
    }
}
