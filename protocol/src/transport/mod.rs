//! # Transport Module
//!
//! Moving opaque bytes between two devices over a link that is small,
//! lossy and slow.
//!
//! ```text
//! fragment.rs — FragmentationCodec: MTU-sized frames with CRC-32, Reassembler
//! session.rs  — per-peer session keys with TTL (SessionManager)
//! envelope.rs — one-byte plaintext/sealed flag in front of every message
//! sender.rs   — FragmentSender: send-with-retry and progress reporting
//! inbox.rs    — receive side: reassemble, open, hand up
//! ```
//!
//! The radio itself is a [`TransportAdapter`] supplied by the platform.

pub mod envelope;
pub mod fragment;
pub mod inbox;
pub mod sender;
pub mod session;

pub use envelope::Envelope;
pub use fragment::{fragment, reassemble, Fragment, FragmentError, Ingested, ReassemblyProgress, Reassembler};
pub use inbox::{InboundMessage, Inbox, InboxEvent};
pub use sender::{FragmentSender, ProgressFn};
pub use session::{SessionManager, TransportSession};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::EncryptionError;

/// Failure reported by the platform link for a single frame.
#[derive(Debug, Clone, Error)]
pub enum TransportIoError {
    #[error("link error: {0}")]
    Link(String),

    #[error("peer {0} unreachable")]
    Unreachable(String),
}

/// Outcome of sending one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReport {
    pub message_id: String,
    pub total: u16,
    pub sent_fragments: Vec<u16>,
    pub failed_fragments: Vec<u16>,
}

impl SendReport {
    pub fn success(&self) -> bool {
        self.failed_fragments.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(
        "message {} incomplete: fragments {:?} failed, {} of {} sent",
        .0.message_id, .0.failed_fragments, .0.sent_fragments.len(), .0.total
    )]
    Incomplete(SendReport),

    #[error("session table full ({max} sessions)")]
    SessionCapacity { max: usize },

    #[error("no live session for peer {0}")]
    NoSession(String),

    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

/// The platform's "send these bytes to that peer" primitive. BLE, NFC,
/// QR animation or a mesh relay all fit behind it.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn send(&self, peer_id: &str, bytes: &[u8]) -> Result<(), TransportIoError>;
}
