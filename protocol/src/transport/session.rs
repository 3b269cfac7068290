//! # Transport Sessions
//!
//! One secure session per peer: a 32-byte key, a creation time and an
//! expiry. Sessions are in-memory only and never written to disk.
//!
//! A session comes into being in one of two ways:
//!
//! - [`SessionManager::install`] with a key agreed through
//!   [`SessionHandshake`](crate::crypto::SessionHandshake); both devices
//!   then hold the same key.
//! - [`SessionManager::get_or_establish`] with a fresh random key, when no
//!   handshake happened. Only this device can open what it seals.
//!
//! Expired sessions are invisible to lookups and are re-established
//! transparently on next use.

use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::TransportError;
use crate::clock::SharedClock;
use crate::config::SESSION_KEY_LENGTH;
use crate::crypto::encryption::{self, EncryptionError};

#[derive(Clone)]
pub struct TransportSession {
    pub peer_id: String,
    /// Shared by both ends after a handshake. Used as AEAD associated data.
    pub session_id: String,
    key: [u8; SESSION_KEY_LENGTH],
    pub created_at: u64,
    pub expires_at: u64,
}

impl TransportSession {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        encryption::seal(&self.key, plaintext, self.session_id.as_bytes())
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        encryption::open(&self.key, sealed, self.session_id.as_bytes())
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("peer_id", &self.peer_id)
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, TransportSession>>,
    clock: SharedClock,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(clock: SharedClock, ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// The live session for `peer_id`, if any.
    pub fn get_secure_session(&self, peer_id: &str) -> Option<TransportSession> {
        let now = self.clock.now();
        let session = self.sessions.read().get(peer_id).cloned()?;
        if session.is_expired_at(now) {
            self.sessions.write().remove(peer_id);
            debug!(peer_id, "session expired");
            return None;
        }
        Some(session)
    }

    /// Reuse the live session for `peer_id` or create one with a random key.
    pub fn get_or_establish(&self, peer_id: &str) -> Result<TransportSession, TransportError> {
        if let Some(session) = self.get_secure_session(peer_id) {
            return Ok(session);
        }
        let mut key = [0u8; SESSION_KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut key);
        self.insert(peer_id, Uuid::new_v4().to_string(), key)
    }

    /// Install a key agreed with the peer, replacing any existing session.
    pub fn install(
        &self,
        peer_id: &str,
        session_id: String,
        key: [u8; SESSION_KEY_LENGTH],
    ) -> Result<TransportSession, TransportError> {
        self.insert(peer_id, session_id, key)
    }

    fn insert(
        &self,
        peer_id: &str,
        session_id: String,
        key: [u8; SESSION_KEY_LENGTH],
    ) -> Result<TransportSession, TransportError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write();

        if !sessions.contains_key(peer_id) && sessions.len() >= self.max_sessions {
            sessions.retain(|_, s| !s.is_expired_at(now));
            if sessions.len() >= self.max_sessions {
                return Err(TransportError::SessionCapacity {
                    max: self.max_sessions,
                });
            }
        }

        let session = TransportSession {
            peer_id: peer_id.to_string(),
            session_id,
            key,
            created_at: now,
            expires_at: now + self.ttl.as_secs(),
        };
        sessions.insert(peer_id.to_string(), session.clone());
        debug!(peer_id, session_id = %session.session_id, "session established");
        Ok(session)
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        self.sessions.write().remove(peer_id).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
