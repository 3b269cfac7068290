//! Receive side of the transport.
//!
//! The platform radio layer hands raw frames to [`Inbox::ingest`] per peer.
//! The inbox reassembles them and, once a message is complete, strips the
//! envelope (opening it with the peer's session if it was sealed).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::envelope::Envelope;
use super::fragment::{Fragment, Ingested, ReassemblyProgress, Reassembler};
use super::session::SessionManager;
use super::TransportError;
use crate::clock::SharedClock;

/// A fully received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer_id: String,
    pub body: Vec<u8>,
    /// Arrived sealed under a transport session.
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxEvent {
    Partial(ReassemblyProgress),
    Message(InboundMessage),
}

pub struct Inbox {
    reassembler: Mutex<Reassembler>,
    sessions: Arc<SessionManager>,
    clock: SharedClock,
}

impl Inbox {
    pub fn new(
        sessions: Arc<SessionManager>,
        clock: SharedClock,
        reassembly_timeout: Duration,
        max_checksum_failures: u32,
    ) -> Self {
        Self {
            reassembler: Mutex::new(Reassembler::new(reassembly_timeout, max_checksum_failures)),
            sessions,
            clock,
        }
    }

    /// Feed one wire frame received from `peer_id`.
    pub fn ingest(&self, peer_id: &str, frame: &[u8]) -> Result<InboxEvent, TransportError> {
        let fragment = Fragment::decode(peer_id, frame)?;
        let now = self.clock.now();
        let ingested = self.reassembler.lock().ingest(fragment, now)?;

        match ingested {
            Ingested::Partial(progress) => Ok(InboxEvent::Partial(progress)),
            Ingested::Complete(bytes) => {
                let envelope = Envelope::decode(&bytes)?;
                let sealed = envelope.is_sealed();
                let body = envelope.open(&self.sessions, peer_id)?;
                debug!(peer_id, len = body.len(), sealed, "message received");
                Ok(InboxEvent::Message(InboundMessage {
                    peer_id: peer_id.to_string(),
                    body,
                    sealed,
                }))
            }
        }
    }

    pub fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        self.reassembler.lock().purge_stale(now)
    }

    pub fn pending(&self) -> usize {
        self.reassembler.lock().pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::fragment::fragment;

    fn inbox() -> (Inbox, Arc<SessionManager>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let sessions = Arc::new(SessionManager::new(shared.clone(), Duration::from_secs(600), 8));
        (
            Inbox::new(sessions.clone(), shared, Duration::from_secs(60), 3),
            sessions,
            clock,
        )
    }

    #[test]
    fn plain_message_through_inbox() {
        let (inbox, _, _) = inbox();
        let wire = Envelope::plain(vec![5u8; 300]).encode();
        let frags = fragment("ignored", &wire, 128).unwrap();

        let mut events: Vec<InboxEvent> = frags
            .iter()
            .map(|f| inbox.ingest("alice", &f.encode()).unwrap())
            .collect();
        let last = events.pop().unwrap();
        assert!(events.iter().all(|e| matches!(e, InboxEvent::Partial(_))));
        assert_eq!(
            last,
            InboxEvent::Message(InboundMessage {
                peer_id: "alice".into(),
                body: vec![5u8; 300],
                sealed: false,
            })
        );
    }

    #[test]
    fn sealed_message_opened_with_session() {
        let (inbox, sessions, _) = inbox();
        let session = sessions.install("alice", "sid".into(), [3; 32]).unwrap();
        let wire = Envelope::seal(&session, b"hi bob").unwrap().encode();

        let mut last = None;
        for f in fragment("x", &wire, 16).unwrap() {
            last = Some(inbox.ingest("alice", &f.encode()).unwrap());
        }
        let Some(InboxEvent::Message(msg)) = last else {
            panic!("message not completed");
        };
        assert!(msg.sealed);
        assert_eq!(msg.body, b"hi bob");
    }

    #[test]
    fn stale_partial_purged() {
        let (inbox, _, clock) = inbox();
        let frags = fragment("x", &Envelope::plain(vec![1; 100]).encode(), 32).unwrap();
        inbox.ingest("alice", &frags[0].encode()).unwrap();
        assert_eq!(inbox.pending(), 1);
        clock.advance(Duration::from_secs(61));
        assert_eq!(inbox.purge_stale(), 1);
    }
}
