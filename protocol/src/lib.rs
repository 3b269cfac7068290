// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # TOSS Protocol: Offline Intent Engine
//!
//! Devices with no network sign "transaction intents", hand them to each
//! other over short-range links, and settle them against the ledger once one
//! of them is back online. Nothing here talks to a chain or a radio
//! directly: the ledger, the link, the credential prompt and the storage
//! backend are all traits the host supplies.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 device keys, AES-256-GCM sealing, X25519 session agreement.
//! - **intent**: the intent model, canonical bytes, signing, nonces.
//! - **nonce_account**: durable nonce accounts behind a credential gate.
//! - **transport**: fragmentation, per-peer sessions, retrying sender, inbox.
//! - **exchange**: peer registry and the offer/answer protocol.
//! - **reconcile**: conflict resolution and settlement against the ledger.
//! - **storage**: the persistence seam with in-memory and sled backends.
//! - **housekeeping**: the periodic sweep.
//! - **device**: everything wired together for one device.
//! - **config**: protocol constants and engine tunables.
//!
//! ## Ground rules
//!
//! 1. Signatures cover a pinned, versioned byte layout. Never a serde format.
//! 2. Every intent ends in an explicit status with a reason.
//! 3. Conflict resolution is a pure function; every device picks the same winner.

pub mod auth;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod exchange;
pub mod housekeeping;
pub mod intent;
pub mod ledger;
pub mod nonce_account;
pub mod reconcile;
pub mod storage;
pub mod transport;

pub use device::{OfferReceipt, OfflineDevice, ReceiveOutcome};
pub use error::{TossError, TossResult};
