//! # NonceLedger
//!
//! Per-signer replay protection. For every signer the ledger tracks the
//! highest nonce seen locally (issued or accepted from a peer) and the
//! highest nonce the authoritative ledger reported.
//!
//! - `issue` hands out `max(local, ledger) + 1`.
//! - `accept` admits an incoming intent only when its nonce is strictly
//!   above everything seen for that signer.
//!
//! Both run while holding the signer's map entry, so two concurrent intent
//! creations for one signer can never receive the same nonce.
//!
//! When the ledger cannot be reached, issuance fails closed: it proceeds
//! from the best local value and reports the nonce as unverified so the
//! intent is re-checked during reconciliation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::keys::PublicKey;
use crate::error::{TossError, TossResult};
use crate::ledger::LedgerClient;
use crate::storage::{RecordStore, StorageResult};

/// Persisted per-signer nonce state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub signer: PublicKey,
    pub local_last: u64,
    pub ledger_observed: u64,
}

impl NonceRecord {
    fn new(signer: PublicKey) -> Self {
        Self {
            signer,
            local_last: 0,
            ledger_observed: 0,
        }
    }

    pub fn highest(&self) -> u64 {
        self.local_last.max(self.ledger_observed)
    }
}

/// A nonce handed out by [`NonceLedger::issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedNonce {
    pub nonce: u64,
    /// True when a fresh ledger reading backed this nonce.
    pub verified: bool,
}

#[derive(Debug, Default)]
pub struct NonceLedger {
    signers: DashMap<PublicKey, NonceRecord>,
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records.
    pub fn load(store: &RecordStore) -> StorageResult<Self> {
        let ledger = Self::new();
        for record in store.list_nonce_records()? {
            ledger.signers.insert(record.signer, record);
        }
        Ok(ledger)
    }

    pub fn persist(&self, store: &RecordStore, signer: &PublicKey) -> StorageResult<()> {
        match self.snapshot(signer) {
            Some(record) => store.put_nonce_record(&record),
            None => Ok(()),
        }
    }

    pub fn snapshot(&self, signer: &PublicKey) -> Option<NonceRecord> {
        self.signers.get(signer).map(|r| *r)
    }

    /// Issue the next nonce. `ledger_observed` is a fresh ledger reading,
    /// if one was obtained.
    pub fn issue(&self, signer: &PublicKey, ledger_observed: Option<u64>) -> IssuedNonce {
        let mut entry = self
            .signers
            .entry(*signer)
            .or_insert_with(|| NonceRecord::new(*signer));
        if let Some(observed) = ledger_observed {
            entry.ledger_observed = entry.ledger_observed.max(observed);
        }
        let nonce = entry.highest() + 1;
        entry.local_last = nonce;

        debug!(signer = %signer, nonce, verified = ledger_observed.is_some(), "nonce issued");
        IssuedNonce {
            nonce,
            verified: ledger_observed.is_some(),
        }
    }

    /// Fetch the signer's ledger nonce, then issue. A ledger failure does
    /// not block issuance; the result is flagged unverified instead.
    pub async fn issue_with_ledger(
        &self,
        signer: &PublicKey,
        ledger: &dyn LedgerClient,
    ) -> IssuedNonce {
        match ledger.get_account_state(signer).await {
            Ok(state) => self.issue(signer, Some(state.observed_nonce)),
            Err(e) => {
                warn!(signer = %signer, error = %e, "ledger unavailable, issuing unverified nonce");
                self.issue(signer, None)
            }
        }
    }

    /// Record a nonce the ledger reports as used.
    pub fn observe_ledger(&self, signer: &PublicKey, observed: u64) {
        let mut entry = self
            .signers
            .entry(*signer)
            .or_insert_with(|| NonceRecord::new(*signer));
        entry.ledger_observed = entry.ledger_observed.max(observed);
    }

    /// Admit an incoming intent's nonce for `signer`. Fails with
    /// [`TossError::Replay`] unless it is strictly above everything seen.
    pub fn accept(&self, signer: &PublicKey, nonce: u64) -> TossResult<()> {
        self.accept_with(signer, nonce, || Ok(()))
    }

    /// Like [`accept`](Self::accept), but `commit` runs under the signer's
    /// entry once the nonce has passed, and the nonce is only recorded if
    /// `commit` succeeds.
    pub fn accept_with<F>(&self, signer: &PublicKey, nonce: u64, commit: F) -> TossResult<()>
    where
        F: FnOnce() -> TossResult<()>,
    {
        let mut entry = self
            .signers
            .entry(*signer)
            .or_insert_with(|| NonceRecord::new(*signer));
        let observed = entry.highest();
        if nonce <= observed {
            warn!(signer = %signer, nonce, observed, "replayed nonce refused");
            return Err(TossError::Replay {
                signer: signer.to_base58(),
                nonce,
                observed,
            });
        }
        commit()?;
        entry.local_last = nonce;
        Ok(())
    }

    pub fn highest(&self, signer: &PublicKey) -> u64 {
        self.signers.get(signer).map(|r| r.highest()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::DeviceKeypair;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn issue_is_max_plus_one() {
        let nonces = NonceLedger::new();
        let signer = DeviceKeypair::generate().public_key();

        assert_eq!(nonces.issue(&signer, None).nonce, 1);
        assert_eq!(nonces.issue(&signer, Some(10)).nonce, 11);
        // ledger lagging behind local never moves us backwards
        assert_eq!(nonces.issue(&signer, Some(3)).nonce, 12);
    }

    #[test]
    fn unverified_when_ledger_missing() {
        let nonces = NonceLedger::new();
        let signer = DeviceKeypair::generate().public_key();
        assert!(!nonces.issue(&signer, None).verified);
        assert!(nonces.issue(&signer, Some(0)).verified);
    }

    #[test]
    fn accept_requires_strictly_increasing() {
        let nonces = NonceLedger::new();
        let signer = DeviceKeypair::generate().public_key();

        nonces.accept(&signer, 5).unwrap();
        assert!(matches!(
            nonces.accept(&signer, 5),
            Err(TossError::Replay { nonce: 5, observed: 5, .. })
        ));
        assert!(nonces.accept(&signer, 4).is_err());
        nonces.accept(&signer, 6).unwrap();
    }

    #[test]
    fn failed_commit_leaves_nonce_unconsumed() {
        let nonces = NonceLedger::new();
        let signer = DeviceKeypair::generate().public_key();

        let err = nonces
            .accept_with(&signer, 3, || Err(TossError::Validation("disk full".into())))
            .unwrap_err();
        assert!(matches!(err, TossError::Validation(_)));
        assert_eq!(nonces.highest(&signer), 0);

        nonces.accept_with(&signer, 3, || Ok(())).unwrap();
        assert_eq!(nonces.highest(&signer), 3);
    }

    #[test]
    fn accept_respects_ledger_observation() {
        let nonces = NonceLedger::new();
        let signer = DeviceKeypair::generate().public_key();
        nonces.observe_ledger(&signer, 10);
        assert!(nonces.accept(&signer, 10).is_err());
        nonces.accept(&signer, 11).unwrap();
    }

    #[test]
    fn concurrent_issue_never_repeats() {
        let nonces = Arc::new(NonceLedger::new());
        let signer = DeviceKeypair::generate().public_key();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let nonces = nonces.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| nonces.issue(&signer, None).nonce)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(*all.last().unwrap(), 800);
    }

    #[test]
    fn persist_and_load() {
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let signer = DeviceKeypair::generate().public_key();
        let nonces = NonceLedger::new();
        nonces.issue(&signer, Some(41));
        nonces.persist(&store, &signer).unwrap();

        let restored = NonceLedger::load(&store).unwrap();
        assert_eq!(restored.highest(&signer), 42);
        assert_eq!(restored.issue(&signer, None).nonce, 43);
    }
}
