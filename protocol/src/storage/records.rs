//! Typed records over a [`PersistentStore`].
//!
//! Every record is bincode-encoded under a prefixed key (see the table in
//! the module root). Intents get an arrival sequence number on first write
//! so reconciliation can drain them in the order they reached this device.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use super::{PersistentStore, StorageError, StorageResult};
use crate::crypto::keys::PublicKey;
use crate::intent::nonce::NonceRecord;
use crate::intent::Intent;
use crate::nonce_account::NonceAccountInfo;
use crate::reconcile::state::{ReconciliationState, SettlementResult};

const INTENT_PREFIX: &str = "intent/";
const SETTLEMENT_PREFIX: &str = "settlement/";
const RECONCILE_PREFIX: &str = "reconcile/";
const NONCE_PREFIX: &str = "nonce/";
const NONCE_ACCOUNT_PREFIX: &str = "nonce-account/";

/// An intent plus its local arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIntent {
    pub seq: u64,
    pub intent: Intent,
}

#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn PersistentStore>,
    /// Last assigned arrival sequence. Held across the read-modify-write of
    /// an intent so concurrent writers cannot interleave.
    intent_seq: Arc<Mutex<u64>>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn PersistentStore>) -> StorageResult<Self> {
        let store = Self {
            backend,
            intent_seq: Arc::new(Mutex::new(0)),
        };
        let highest = store
            .list_stored_intents()?
            .iter()
            .map(|s| s.seq)
            .max()
            .unwrap_or(0);
        *store.intent_seq.lock() = highest;
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn PersistentStore> {
        &self.backend
    }

    // -- generic helpers ----------------------------------------------------

    fn put_record<T: Serialize>(&self, key: &str, record: &T) -> StorageResult<()> {
        let bytes = bincode::serialize(record).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.backend.put(key, bytes)
    }

    fn get_record<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.backend.get(key)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Codec(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, prefix: &str) -> StorageResult<Vec<T>> {
        self.backend
            .list_by_prefix(prefix)?
            .into_iter()
            .map(|(key, bytes)| {
                bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::Codec(format!("{}: {}", key, e)))
            })
            .collect()
    }

    // -- intents ------------------------------------------------------------

    /// Insert or update an intent.
    ///
    /// A new intent gets the next arrival sequence; an update keeps its
    /// original one. An update may only change the bookkeeping fields, and
    /// a terminal intent can only be rewritten with identical contents.
    pub fn put_intent(&self, intent: &Intent) -> StorageResult<u64> {
        let key = format!("{}{}", INTENT_PREFIX, intent.id);
        let mut seq_guard = self.intent_seq.lock();

        let seq = match self.get_record::<StoredIntent>(&key)? {
            Some(existing) => {
                if !existing.intent.same_signed_content(intent) {
                    return Err(StorageError::IdCollision { key });
                }
                if existing.intent.status.is_terminal() && existing.intent != *intent {
                    return Err(StorageError::Immutable { key });
                }
                existing.seq
            }
            None => {
                *seq_guard += 1;
                *seq_guard
            }
        };

        self.put_record(
            &key,
            &StoredIntent {
                seq,
                intent: intent.clone(),
            },
        )?;
        Ok(seq)
    }

    pub fn get_intent(&self, id: &str) -> StorageResult<Option<Intent>> {
        Ok(self
            .get_record::<StoredIntent>(&format!("{}{}", INTENT_PREFIX, id))?
            .map(|s| s.intent))
    }

    /// All intents in arrival order.
    pub fn list_stored_intents(&self) -> StorageResult<Vec<StoredIntent>> {
        let mut stored: Vec<StoredIntent> = self.list_records(INTENT_PREFIX)?;
        stored.sort_by_key(|s| s.seq);
        Ok(stored)
    }

    pub fn list_intents(&self) -> StorageResult<Vec<Intent>> {
        Ok(self
            .list_stored_intents()?
            .into_iter()
            .map(|s| s.intent)
            .collect())
    }

    /// Intents a reconciliation pass should consider, in arrival order.
    pub fn settleable_intents(&self) -> StorageResult<Vec<Intent>> {
        Ok(self
            .list_intents()?
            .into_iter()
            .filter(|i| i.status.is_settleable())
            .collect())
    }

    /// Housekeeping only.
    pub fn delete_intent(&self, id: &str) -> StorageResult<bool> {
        let _guard = self.intent_seq.lock();
        self.backend.delete(&format!("{}{}", INTENT_PREFIX, id))
    }

    // -- settlement results -------------------------------------------------

    pub fn put_settlement(&self, result: &SettlementResult) -> StorageResult<()> {
        self.put_record(&format!("{}{}", SETTLEMENT_PREFIX, result.intent_id), result)
    }

    pub fn get_settlement(&self, intent_id: &str) -> StorageResult<Option<SettlementResult>> {
        self.get_record(&format!("{}{}", SETTLEMENT_PREFIX, intent_id))
    }

    pub fn list_settlements(&self) -> StorageResult<Vec<SettlementResult>> {
        self.list_records(SETTLEMENT_PREFIX)
    }

    /// Housekeeping only, alongside [`delete_intent`](Self::delete_intent).
    pub fn delete_settlement(&self, intent_id: &str) -> StorageResult<bool> {
        self.backend
            .delete(&format!("{}{}", SETTLEMENT_PREFIX, intent_id))
    }

    // -- reconciliation state -----------------------------------------------

    pub fn put_reconciliation_state(&self, state: &ReconciliationState) -> StorageResult<()> {
        self.put_record(
            &format!("{}{}", RECONCILE_PREFIX, state.signer.to_base58()),
            state,
        )
    }

    pub fn get_reconciliation_state(
        &self,
        signer: &PublicKey,
    ) -> StorageResult<Option<ReconciliationState>> {
        self.get_record(&format!("{}{}", RECONCILE_PREFIX, signer.to_base58()))
    }

    // -- nonce records ------------------------------------------------------

    pub fn put_nonce_record(&self, record: &NonceRecord) -> StorageResult<()> {
        self.put_record(
            &format!("{}{}", NONCE_PREFIX, record.signer.to_base58()),
            record,
        )
    }

    pub fn get_nonce_record(&self, signer: &PublicKey) -> StorageResult<Option<NonceRecord>> {
        self.get_record(&format!("{}{}", NONCE_PREFIX, signer.to_base58()))
    }

    pub fn list_nonce_records(&self) -> StorageResult<Vec<NonceRecord>> {
        self.list_records(NONCE_PREFIX)
    }

    // -- nonce accounts -----------------------------------------------------

    pub fn put_nonce_account(&self, info: &NonceAccountInfo) -> StorageResult<()> {
        self.put_record(
            &format!("{}{}", NONCE_ACCOUNT_PREFIX, info.address.to_base58()),
            info,
        )
    }

    pub fn get_nonce_account(&self, address: &PublicKey) -> StorageResult<Option<NonceAccountInfo>> {
        self.get_record(&format!("{}{}", NONCE_ACCOUNT_PREFIX, address.to_base58()))
    }

    pub fn list_nonce_accounts(&self) -> StorageResult<Vec<NonceAccountInfo>> {
        self.list_records(NONCE_ACCOUNT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::keys::DeviceKeypair;
    use crate::intent::{IntentCodec, IntentExtras, IntentStatus};
    use crate::storage::{MemoryStore, SledStore};

    const NOW: u64 = 1_700_000_000;

    fn make_intent(codec: &IntentCodec, keys: &DeviceKeypair, nonce: u64) -> Intent {
        codec
            .create(
                keys,
                DeviceKeypair::generate().public_key(),
                100,
                nonce,
                NOW + 600,
                IntentExtras::default(),
            )
            .unwrap()
    }

    fn codec() -> IntentCodec {
        IntentCodec::new(Arc::new(ManualClock::new(NOW)))
    }

    #[test]
    fn intents_listed_in_arrival_order() {
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let codec = codec();
        let keys = DeviceKeypair::generate();

        let ids: Vec<String> = (1..=5)
            .map(|n| {
                let intent = make_intent(&codec, &keys, n);
                store.put_intent(&intent).unwrap();
                intent.id
            })
            .collect();

        let listed: Vec<String> = store.list_intents().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn update_keeps_arrival_sequence() {
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let codec = codec();
        let keys = DeviceKeypair::generate();
        let mut intent = make_intent(&codec, &keys, 1);

        let first = store.put_intent(&intent).unwrap();
        store.put_intent(&make_intent(&codec, &keys, 2)).unwrap();
        intent.transition(IntentStatus::Failed, Some("timeout".into()), NOW + 5);
        assert_eq!(store.put_intent(&intent).unwrap(), first);
    }

    #[test]
    fn terminal_intent_is_immutable() {
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let codec = codec();
        let keys = DeviceKeypair::generate();
        let mut intent = make_intent(&codec, &keys, 1);
        intent.transition(IntentStatus::Settled, None, NOW + 1);
        store.put_intent(&intent).unwrap();

        // identical rewrite is fine
        store.put_intent(&intent).unwrap();

        let mut changed = intent.clone();
        changed.status = IntentStatus::Pending;
        assert!(matches!(
            store.put_intent(&changed),
            Err(StorageError::Immutable { .. })
        ));
        assert_eq!(
            store.get_intent(&intent.id).unwrap().unwrap().status,
            IntentStatus::Settled
        );
    }

    #[test]
    fn different_intent_under_same_id_is_refused() {
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let codec = codec();
        let original = make_intent(&codec, &DeviceKeypair::generate(), 1);
        store.put_intent(&original).unwrap();

        let other = codec
            .create(
                &DeviceKeypair::generate(),
                original.recipient,
                7,
                1,
                NOW + 600,
                IntentExtras {
                    id: Some(original.id.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            store.put_intent(&other),
            Err(StorageError::IdCollision { .. })
        ));

        let held = store.get_intent(&original.id).unwrap().unwrap();
        assert_eq!(held.sender, original.sender);
        assert_eq!(held.amount, 100);
    }

    #[test]
    fn settleable_filters_terminal() {
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let codec = codec();
        let keys = DeviceKeypair::generate();

        let pending = make_intent(&codec, &keys, 1);
        let mut failed = make_intent(&codec, &keys, 2);
        failed.transition(IntentStatus::Failed, None, NOW);
        let mut rejected = make_intent(&codec, &keys, 3);
        rejected.transition(IntentStatus::Rejected, None, NOW);
        for i in [&pending, &failed, &rejected] {
            store.put_intent(i).unwrap();
        }

        let ids: Vec<_> = store
            .settleable_intents()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![pending.id, failed.id]);
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let codec = codec();
        let keys = DeviceKeypair::generate();
        {
            let store = RecordStore::new(Arc::new(SledStore::open(dir.path()).unwrap())).unwrap();
            store.put_intent(&make_intent(&codec, &keys, 1)).unwrap();
            store.put_intent(&make_intent(&codec, &keys, 2)).unwrap();
        }
        let store = RecordStore::new(Arc::new(SledStore::open(dir.path()).unwrap())).unwrap();
        let seq = store.put_intent(&make_intent(&codec, &keys, 3)).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(store.list_intents().unwrap().len(), 3);
    }
}
