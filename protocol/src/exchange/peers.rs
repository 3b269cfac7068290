//! # PeerRegistry
//!
//! Bookkeeping for devices seen over short-range links. No I/O beyond the
//! clock: discovery itself happens in the platform radio layer, which calls
//! [`PeerRegistry::register`] on every sighting.
//!
//! Peers fall out of the registry when they have not been seen for the
//! timeout window, or when the registry is full and a new peer shows up (the
//! least recently seen one makes room).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::DEFAULT_TRUST_SCORE;

/// Link a peer was discovered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Ble,
    Nfc,
    QrCode,
    Mesh,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "ble"),
            Self::Nfc => write!(f, "nfc"),
            Self::QrCode => write!(f, "qr"),
            Self::Mesh => write!(f, "mesh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    pub id: String,
    pub transport: TransportKind,
    pub last_seen: u64,
    /// 0–100.
    pub trust_score: u8,
    /// RSSI in dBm, when the link reports one.
    pub signal_strength: Option<i16>,
}

pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerDevice>>,
    clock: SharedClock,
    timeout: Duration,
    capacity: usize,
}

impl PeerRegistry {
    pub fn new(clock: SharedClock, timeout: Duration, capacity: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            clock,
            timeout,
            capacity: capacity.max(1),
        }
    }

    /// Record a sighting. Existing peers keep their trust score.
    pub fn register(
        &self,
        id: &str,
        transport: TransportKind,
        signal_strength: Option<i16>,
    ) -> PeerDevice {
        let now = self.clock.now();
        let mut peers = self.peers.write();

        if let Some(peer) = peers.get_mut(id) {
            peer.last_seen = now;
            peer.transport = transport;
            if signal_strength.is_some() {
                peer.signal_strength = signal_strength;
            }
            return peer.clone();
        }

        if peers.len() >= self.capacity {
            let oldest = peers
                .values()
                .min_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| a.id.cmp(&b.id)))
                .map(|p| p.id.clone());
            if let Some(evicted) = oldest {
                peers.remove(&evicted);
                debug!(peer_id = %evicted, "peer evicted at capacity");
            }
        }

        let peer = PeerDevice {
            id: id.to_string(),
            transport,
            last_seen: now,
            trust_score: DEFAULT_TRUST_SCORE,
            signal_strength,
        };
        peers.insert(id.to_string(), peer.clone());
        debug!(peer_id = id, %transport, "peer discovered");
        peer
    }

    /// Refresh `last_seen` for a known peer. Returns false for unknown ids.
    pub fn touch(&self, id: &str) -> bool {
        let now = self.clock.now();
        match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Peers seen within the timeout window, most recent first. Stale ones
    /// are purged on the way.
    pub fn active_peers(&self) -> Vec<PeerDevice> {
        self.purge_expired();
        let mut active: Vec<PeerDevice> = self.peers.read().values().cloned().collect();
        active.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        active
    }

    pub fn get(&self, id: &str) -> Option<PeerDevice> {
        let now = self.clock.now();
        self.peers
            .read()
            .get(id)
            .filter(|p| !self.is_stale(p, now))
            .cloned()
    }

    /// Adjust a peer's trust by `delta`, clamped to `[0, max]`.
    pub fn update_trust(&self, id: &str, delta: i32, max: u8) -> Option<u8> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(id)?;
        let updated = (peer.trust_score as i32 + delta).clamp(0, max as i32);
        peer.trust_score = updated as u8;
        Some(peer.trust_score)
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, p| !self.is_stale(p, now));
        before - peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_stale(&self, peer: &PeerDevice, now: u64) -> bool {
        now.saturating_sub(peer.last_seen) > self.timeout.as_secs()
    }
}
