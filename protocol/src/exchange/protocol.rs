//! # ExchangeProtocol
//!
//! Request/response for offering an intent to a peer.
//!
//! ```text
//! Created ──► Sent ──┬──► Acked(Accepted | Rejected | Deferred)
//!                    └──► Expired          (exchange TTL, default 2 min)
//! ```
//!
//! When encryption is asked for and a peer is named, the intent is sealed
//! with that peer's transport session. If sealing fails the request goes out
//! in plaintext with `plaintext_fallback` set and a warning logged, so the
//! downgrade is always visible.
//!
//! Resolving a sealed request that cannot be opened yields `None`, the same
//! answer as for an unknown id. Callers never learn whether the key was
//! wrong.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::peers::PeerRegistry;
use crate::clock::SharedClock;
use crate::crypto::handshake::SessionHello;
use crate::error::{TossError, TossResult};
use crate::intent::{Intent, IntentCodec};
use crate::transport::SessionManager;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeStatus {
    Accepted,
    Rejected,
    /// The peer got it but will decide later (e.g. storage busy).
    Deferred,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeBody {
    Plain(Intent),
    /// bincode(Intent) sealed with the session toward the counterpart.
    Sealed(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub request_id: String,
    pub timestamp: u64,
    pub expires_at: u64,
    pub requester_id: String,
    pub peer_id: Option<String>,
    pub encrypted: bool,
    /// Encryption was requested but the body went out in plaintext.
    pub plaintext_fallback: bool,
    pub body: ExchangeBody,
}

impl ExchangeRequest {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn intent(&self) -> Option<&Intent> {
        match &self.body {
            ExchangeBody::Plain(intent) => Some(intent),
            ExchangeBody::Sealed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub request_id: String,
    pub status: ExchangeStatus,
    pub reason: Option<String>,
    pub acknowledged: Vec<String>,
    pub timestamp: u64,
}

/// Everything that travels between two devices, after reassembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Hello(SessionHello),
    HelloReply(SessionHello),
    Request(ExchangeRequest),
    Response(ExchangeResponse),
}

impl WireMessage {
    pub fn encode(&self) -> TossResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> TossResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Request tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Acked(ExchangeStatus),
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
struct TrackedRequest {
    request: ExchangeRequest,
    state: RequestState,
    direction: Direction,
}

impl TrackedRequest {
    /// The device on the other end of this request.
    fn counterpart(&self) -> Option<&str> {
        match self.direction {
            Direction::Outgoing => self.request.peer_id.as_deref(),
            Direction::Incoming => Some(self.request.requester_id.as_str()),
        }
    }
}

pub struct ExchangeProtocol {
    requests: DashMap<String, TrackedRequest>,
    peers: Arc<PeerRegistry>,
    sessions: Arc<SessionManager>,
    codec: IntentCodec,
    clock: SharedClock,
    ttl: Duration,
}

impl ExchangeProtocol {
    pub fn new(
        peers: Arc<PeerRegistry>,
        sessions: Arc<SessionManager>,
        codec: IntentCodec,
        clock: SharedClock,
        ttl: Duration,
    ) -> Self {
        Self {
            requests: DashMap::new(),
            peers,
            sessions,
            codec,
            clock,
            ttl,
        }
    }

    /// Wrap `intent` in a new outgoing request.
    ///
    /// The intent must verify. A named peer must be known to the registry.
    pub fn create_request(
        &self,
        intent: &Intent,
        requester_id: &str,
        peer_id: Option<&str>,
        use_encryption: bool,
    ) -> TossResult<ExchangeRequest> {
        let verification = self.codec.verify(intent);
        if !verification.valid {
            let reason = verification
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "invalid".into());
            return Err(TossError::Validation(reason));
        }
        if let Some(peer) = peer_id {
            if self.peers.get(peer).is_none() {
                return Err(TossError::NotFound(format!("peer {}", peer)));
            }
        }

        let (body, encrypted, plaintext_fallback) = match (use_encryption, peer_id) {
            (true, Some(peer)) => match self.seal_for(peer, intent) {
                Ok(sealed) => (ExchangeBody::Sealed(sealed), true, false),
                Err(e) => {
                    warn!(
                        intent_id = %intent.id,
                        peer_id = peer,
                        error = %e,
                        "encryption failed, sending intent in plaintext"
                    );
                    (ExchangeBody::Plain(intent.clone()), false, true)
                }
            },
            (true, None) => {
                warn!(intent_id = %intent.id, "no peer to encrypt for, sending intent in plaintext");
                (ExchangeBody::Plain(intent.clone()), false, true)
            }
            (false, _) => (ExchangeBody::Plain(intent.clone()), false, false),
        };

        let now = self.clock.now();
        let request = ExchangeRequest {
            request_id: Uuid::new_v4().to_string(),
            timestamp: now,
            expires_at: now + self.ttl.as_secs(),
            requester_id: requester_id.to_string(),
            peer_id: peer_id.map(str::to_string),
            encrypted,
            plaintext_fallback,
            body,
        };

        self.requests.insert(
            request.request_id.clone(),
            TrackedRequest {
                request: request.clone(),
                state: RequestState::Created,
                direction: Direction::Outgoing,
            },
        );
        debug!(request_id = %request.request_id, intent_id = %intent.id, encrypted, "exchange request created");
        Ok(request)
    }

    fn seal_for(&self, peer: &str, intent: &Intent) -> TossResult<Vec<u8>> {
        let session = self.sessions.get_or_establish(peer)?;
        let plaintext = bincode::serialize(intent)?;
        Ok(session.seal(&plaintext)?)
    }

    pub fn mark_sent(&self, request_id: &str) -> TossResult<()> {
        let mut tracked = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| TossError::NotFound(format!("request {}", request_id)))?;
        if tracked.state == RequestState::Created {
            tracked.state = RequestState::Sent;
        }
        Ok(())
    }

    /// Track a request that arrived from a peer so it can be answered.
    pub fn accept_incoming(&self, request: ExchangeRequest) -> TossResult<()> {
        if request.is_expired_at(self.clock.now()) {
            return Err(TossError::Expired(format!("request {}", request.request_id)));
        }
        self.peers.touch(&request.requester_id);
        self.requests.insert(
            request.request_id.clone(),
            TrackedRequest {
                request,
                state: RequestState::Sent,
                direction: Direction::Incoming,
            },
        );
        Ok(())
    }

    /// Answer a tracked request.
    pub fn respond(
        &self,
        request_id: &str,
        status: ExchangeStatus,
        reason: Option<String>,
    ) -> TossResult<ExchangeResponse> {
        let now = self.clock.now();
        let expires_at = self
            .requests
            .get(request_id)
            .map(|t| t.request.expires_at)
            .ok_or_else(|| TossError::NotFound(format!("request {}", request_id)))?;
        if now >= expires_at {
            return Err(TossError::Expired(format!("request {}", request_id)));
        }

        let acknowledged = match status {
            ExchangeStatus::Accepted => self
                .resolve_request(request_id, None)
                .and_then(|r| r.intent().map(|i| i.id.clone()))
                .into_iter()
                .collect(),
            _ => Vec::new(),
        };

        if let Some(mut tracked) = self.requests.get_mut(request_id) {
            tracked.state = RequestState::Acked(status);
        }

        info!(request_id, %status, "exchange request answered");
        Ok(ExchangeResponse {
            request_id: request_id.to_string(),
            status,
            reason,
            acknowledged,
            timestamp: now,
        })
    }

    /// Apply a peer's answer to one of our requests.
    pub fn record_response(&self, response: &ExchangeResponse) -> TossResult<()> {
        let mut tracked = self
            .requests
            .get_mut(&response.request_id)
            .ok_or_else(|| TossError::NotFound(format!("request {}", response.request_id)))?;
        tracked.state = RequestState::Acked(response.status);
        Ok(())
    }

    /// The request with its intent in plaintext, or `None` if it is unknown,
    /// expired, or cannot be opened. `peer_id` overrides which session is
    /// used; by default it is the one toward the other end of the request.
    pub fn resolve_request(&self, request_id: &str, peer_id: Option<&str>) -> Option<ExchangeRequest> {
        let tracked = self.requests.get(request_id)?.clone();
        if tracked.request.is_expired_at(self.clock.now()) {
            return None;
        }

        let mut request = tracked.request.clone();
        if let ExchangeBody::Sealed(sealed) = &tracked.request.body {
            let peer = peer_id.or_else(|| tracked.counterpart())?;
            let session = self.sessions.get_secure_session(peer)?;
            let plaintext = session.open(sealed).ok()?;
            let intent: Intent = bincode::deserialize(&plaintext).ok()?;
            request.body = ExchangeBody::Plain(intent);
        }
        Some(request)
    }

    pub fn state(&self, request_id: &str) -> Option<RequestState> {
        let tracked = self.requests.get(request_id)?;
        match tracked.state {
            RequestState::Created | RequestState::Sent
                if tracked.request.is_expired_at(self.clock.now()) =>
            {
                Some(RequestState::Expired)
            }
            state => Some(state),
        }
    }

    /// Forget requests past their expiry.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.requests.len();
        self.requests.retain(|_, t| !t.request.is_expired_at(now));
        before - self.requests.len()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
