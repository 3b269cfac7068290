//! # Storage Module
//!
//! Local persistence for a device. Intents must survive restarts, crashes
//! and arbitrarily long offline stretches, so everything that matters for
//! settlement correctness is written here before it is acted on.
//!
//! ## Architecture
//!
//! ```text
//! mod.rs        — PersistentStore trait + StorageError
//! memory.rs     — MemoryStore: BTreeMap behind a RwLock (tests, ephemeral devices)
//! sled_store.rs — SledStore: sled-backed persistent store
//! records.rs    — RecordStore: typed, bincode-encoded records on top of either
//! ```
//!
//! ## Key spaces
//!
//! | Prefix            | Record                    |
//! |-------------------|---------------------------|
//! | `intent/`         | `StoredIntent`            |
//! | `settlement/`     | `SettlementResult`        |
//! | `reconcile/`      | `ReconciliationState`     |
//! | `nonce/`          | `NonceRecord`             |
//! | `nonce-account/`  | `NonceAccountInfo`        |
//!
//! The store is append/update-only. `delete` exists for housekeeping of
//! terminal, long-expired intents and their settlement records, and nothing
//! else.

pub mod memory;
pub mod records;
pub mod sled_store;

pub use memory::MemoryStore;
pub use records::{RecordStore, StoredIntent};
pub use sled_store::SledStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("record {key} is terminal and cannot change")]
    Immutable { key: String },

    #[error("record {key} already holds a different intent")]
    IdCollision { key: String },

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Byte-level key/value persistence.
///
/// Implementations must be safe to share between tasks. Keys are UTF-8
/// strings; `list_by_prefix` returns entries in ascending key order.
pub trait PersistentStore: Send + Sync {
    fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> StorageResult<bool>;
}
