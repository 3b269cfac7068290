//! # Protocol Configuration & Constants
//!
//! Every magic number in TOSS lives here. Two devices that disagree on one
//! of the wire-level constants below will not talk to each other, so treat
//! the first section as frozen once devices ship.
//!
//! The second half is [`EngineConfig`]: the tunables that a device operator
//! may reasonably change (timeouts, capacities, retry budget). It is
//! serde-friendly so the node can load it from a JSON file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire-level constants
// ---------------------------------------------------------------------------

/// Version of the canonical intent schema. Bump on any change to the signed
/// byte layout; old signatures stay verifiable only under their own version.
pub const INTENT_SCHEMA_VERSION: u8 = 1;

/// Domain tag prepended to the canonical intent bytes so an intent signature
/// can never be confused with a signature over some other message type.
pub const INTENT_DOMAIN_TAG: &[u8] = b"TOSS-INTENT";

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Transport session key length (AES-256-GCM key).
pub const SESSION_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Not 16.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Fragment header: `[index: u16][total: u16][checksum: u32]`, big-endian.
pub const FRAGMENT_HEADER_LEN: usize = 8;

/// Default link MTU. BLE 5 devices typically negotiate an ATT MTU around
/// 512 bytes; older stacks fall back to far less and must say so.
pub const DEFAULT_MTU: usize = 512;

/// Envelope flag for a plaintext message body.
pub const ENVELOPE_PLAINTEXT: u8 = 0x00;

/// Envelope flag for a body sealed with the peer's session key.
pub const ENVELOPE_SEALED: u8 = 0x01;

/// Base58 address of the ledger's system program. Durable nonce accounts
/// must be owned by it.
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

/// Rejection reason recorded on conflict-resolution losers.
pub const SUPERSEDED_REASON: &str = "superseded-by-conflict-resolution";

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Peers not seen for this long are purged from the registry.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Maximum number of tracked peers before the least recently seen is evicted.
pub const MAX_PEERS: usize = 50;

/// Trust score assigned to a freshly discovered peer.
pub const DEFAULT_TRUST_SCORE: u8 = 50;

/// Upper bound for trust scores.
pub const MAX_TRUST_SCORE: u8 = 100;

/// Transport session lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Maximum number of live transport sessions held at once.
pub const MAX_SESSIONS: usize = 64;

/// Exchange request lifetime.
pub const EXCHANGE_TTL: Duration = Duration::from_secs(2 * 60);

/// Partial reassembly buffers are dropped after this much inactivity.
/// Aligned with the session TTL.
pub const REASSEMBLY_TIMEOUT: Duration = SESSION_TTL;

/// Checksum failures tolerated per message before its buffer is discarded.
pub const MAX_CHECKSUM_FAILURES: u32 = 3;

/// Send attempts per fragment, including the first one.
pub const SEND_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the first retry; doubles on every further attempt.
pub const SEND_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Lifetime of a cached nonce-account entry.
pub const NONCE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Nonce accounts older than this are considered expired by policy.
pub const NONCE_ACCOUNT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Period of the background housekeeping sweep.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Terminal intents past their expiry are kept this long before housekeeping
/// deletes them.
pub const INTENT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Per-fragment retry budget with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per fragment (first try included). Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(1u64 << shift))
    }

    /// Attempts actually performed, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: SEND_MAX_ATTEMPTS,
            initial_backoff_ms: SEND_INITIAL_BACKOFF.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tunable parameters for a device engine.
///
/// Durations are stored as plain integers so a hand-written JSON config stays
/// readable; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub peer_timeout_secs: u64,
    pub max_peers: usize,
    pub session_ttl_secs: u64,
    pub max_sessions: usize,
    pub exchange_ttl_secs: u64,
    pub reassembly_timeout_secs: u64,
    pub max_checksum_failures: u32,
    /// Link MTU used when fragmenting outbound messages.
    pub mtu: usize,
    pub retry: RetryPolicy,
    pub nonce_cache_ttl_secs: u64,
    pub nonce_account_max_age_secs: u64,
    pub housekeeping_interval_secs: u64,
    pub intent_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_timeout_secs: PEER_TIMEOUT.as_secs(),
            max_peers: MAX_PEERS,
            session_ttl_secs: SESSION_TTL.as_secs(),
            max_sessions: MAX_SESSIONS,
            exchange_ttl_secs: EXCHANGE_TTL.as_secs(),
            reassembly_timeout_secs: REASSEMBLY_TIMEOUT.as_secs(),
            max_checksum_failures: MAX_CHECKSUM_FAILURES,
            mtu: DEFAULT_MTU,
            retry: RetryPolicy::default(),
            nonce_cache_ttl_secs: NONCE_CACHE_TTL.as_secs(),
            nonce_account_max_age_secs: NONCE_ACCOUNT_MAX_AGE.as_secs(),
            housekeeping_interval_secs: HOUSEKEEPING_INTERVAL.as_secs(),
            intent_retention_secs: INTENT_RETENTION.as_secs(),
        }
    }
}

impl EngineConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn exchange_ttl(&self) -> Duration {
        Duration::from_secs(self.exchange_ttl_secs)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }

    pub fn nonce_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_cache_ttl_secs)
    }

    pub fn nonce_account_max_age(&self) -> Duration {
        Duration::from_secs(self.nonce_account_max_age_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }

    pub fn intent_retention(&self) -> Duration {
        Duration::from_secs(self.intent_retention_secs)
    }

    /// Usable payload bytes per fragment at the configured MTU.
    pub fn chunk_size(&self) -> Option<usize> {
        self.mtu.checked_sub(FRAGMENT_HEADER_LEN).filter(|c| *c > 0)
    }
}
