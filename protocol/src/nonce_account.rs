//! # NonceAccountManager
//!
//! Durable nonce accounts are ledger objects that hold a nonce a device can
//! sign against without a fresh round-trip, which is what makes signing
//! across a long offline stretch possible at all.
//!
//! The manager owns the local view of those accounts:
//!
//! - creation is delegated to the ledger client, behind the credential gate;
//! - reads go through a short-lived cache, again behind a caller-supplied
//!   authorization step;
//! - renewal pulls the current nonce from the ledger, behind the gate;
//! - consumption advances `last_used_nonce`, and only reconciliation does
//!   it, after the ledger confirmed the settlement;
//! - revocation is permanent.
//!
//! Cache entries expire on a fixed interval and are swept by housekeeping.
//! An expired cache entry only means "ask again". The account itself stays
//! valid until revoked or too old by policy.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::CredentialGate;
use crate::clock::SharedClock;
use crate::crypto::keys::PublicKey;
use crate::error::{TossError, TossResult};
use crate::ledger::LedgerClient;
use crate::storage::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NonceAccountStatus {
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceAccountInfo {
    pub address: PublicKey,
    pub authorized_signer: PublicKey,
    pub current_nonce: u64,
    pub last_used_nonce: u64,
    pub status: NonceAccountStatus,
    pub created_at: u64,
    pub last_modified: u64,
}

#[derive(Debug, Clone)]
struct CachedAccount {
    info: NonceAccountInfo,
    cached_at: u64,
}

pub struct NonceAccountManager {
    ledger: Arc<dyn LedgerClient>,
    gate: Arc<dyn CredentialGate>,
    store: RecordStore,
    clock: SharedClock,
    cache: DashMap<PublicKey, CachedAccount>,
    cache_ttl: Duration,
    max_age: Duration,
}

impl NonceAccountManager {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        gate: Arc<dyn CredentialGate>,
        store: RecordStore,
        clock: SharedClock,
        cache_ttl: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            ledger,
            gate,
            store,
            clock,
            cache: DashMap::new(),
            cache_ttl,
            max_age,
        }
    }

    /// Create a nonce account on the ledger for `owner`, controlled by
    /// `authority`. Aborts with no side effects if the gate says no.
    pub async fn create_nonce_account(
        &self,
        owner: &PublicKey,
        authority: &PublicKey,
    ) -> TossResult<NonceAccountInfo> {
        if !self.gate.authorize("Create a durable nonce account").await {
            return Err(TossError::Authorization(
                "nonce account creation denied".into(),
            ));
        }

        let state = self.ledger.create_nonce_account(owner, authority).await?;
        let now = self.clock.now();
        let info = NonceAccountInfo {
            address: state.address,
            authorized_signer: state.authority,
            current_nonce: state.nonce,
            last_used_nonce: 0,
            status: NonceAccountStatus::Active,
            created_at: now,
            last_modified: now,
        };
        self.store.put_nonce_account(&info)?;
        self.cache_put(info.clone());

        info!(address = %info.address, authority = %info.authorized_signer, "nonce account created");
        Ok(info)
    }

    /// Look up an account after `authorize` succeeds. Returns `None` when
    /// authorization is refused or the account is unknown everywhere.
    pub async fn get_secure<F, Fut>(
        &self,
        address: &PublicKey,
        authorize: F,
    ) -> TossResult<Option<NonceAccountInfo>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        if !authorize().await {
            warn!(address = %address, "nonce account read not authorized");
            return Ok(None);
        }

        if let Some(info) = self.lookup(address)? {
            return Ok(Some(info));
        }

        // Unknown locally: adopt it from the ledger.
        let Some(state) = self.ledger.get_nonce_account(address).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let info = NonceAccountInfo {
            address: state.address,
            authorized_signer: state.authority,
            current_nonce: state.nonce,
            last_used_nonce: 0,
            status: NonceAccountStatus::Active,
            created_at: now,
            last_modified: now,
        };
        self.store.put_nonce_account(&info)?;
        self.cache_put(info.clone());
        Ok(Some(info))
    }

    /// Fresh cache hit or the persisted record, without any gate. Used
    /// internally where the caller already went through one.
    pub fn lookup(&self, address: &PublicKey) -> TossResult<Option<NonceAccountInfo>> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.get(address) {
            if now.saturating_sub(cached.cached_at) < self.cache_ttl.as_secs() {
                return Ok(Some(cached.info.clone()));
            }
        }
        let stored = self.store.get_nonce_account(address)?;
        if let Some(info) = &stored {
            self.cache_put(info.clone());
        }
        Ok(stored)
    }

    /// Re-read the current nonce from the ledger. Gated like creation.
    /// Revoked accounts are returned unchanged; accounts that vanished from
    /// the ledger are marked expired.
    pub async fn renew(&self, address: &PublicKey) -> TossResult<Option<NonceAccountInfo>> {
        if !self.gate.authorize("Renew a durable nonce account").await {
            return Err(TossError::Authorization(
                "nonce account renewal denied".into(),
            ));
        }
        let Some(mut info) = self.lookup(address)? else {
            return Ok(None);
        };
        if info.status == NonceAccountStatus::Revoked {
            return Ok(Some(info));
        }

        let now = self.clock.now();
        match self.ledger.get_nonce_account(address).await? {
            Some(state) => {
                info.current_nonce = state.nonce;
                info.authorized_signer = state.authority;
            }
            None => {
                warn!(address = %address, "nonce account no longer on ledger");
                info.status = NonceAccountStatus::Expired;
            }
        }
        info.last_modified = now;
        self.store.put_nonce_account(&info)?;
        self.cache_put(info.clone());
        Ok(Some(info))
    }

    /// Active and younger than the configured maximum age.
    pub fn is_valid(&self, info: &NonceAccountInfo) -> bool {
        info.status == NonceAccountStatus::Active
            && self.clock.now().saturating_sub(info.created_at) < self.max_age.as_secs()
    }

    /// Permanently revoke an account. Gated like creation.
    pub async fn revoke(&self, address: &PublicKey) -> TossResult<()> {
        if !self.gate.authorize("Revoke a durable nonce account").await {
            return Err(TossError::Authorization(
                "nonce account revocation denied".into(),
            ));
        }
        let mut info = self
            .lookup(address)?
            .ok_or_else(|| TossError::NotFound(format!("nonce account {}", address)))?;
        info.status = NonceAccountStatus::Revoked;
        info.last_modified = self.clock.now();
        self.store.put_nonce_account(&info)?;
        self.cache.remove(address);

        info!(address = %address, "nonce account revoked");
        Ok(())
    }

    /// Record that `nonce` was consumed by a settled intent.
    pub(crate) fn consume(&self, address: &PublicKey, nonce: u64) -> TossResult<()> {
        let mut info = self
            .lookup(address)?
            .ok_or_else(|| TossError::NotFound(format!("nonce account {}", address)))?;
        info.last_used_nonce = info.last_used_nonce.max(nonce);
        info.last_modified = self.clock.now();
        self.store.put_nonce_account(&info)?;
        self.cache_put(info);
        Ok(())
    }

    /// Drop cache entries older than the cache TTL. Returns how many went.
    pub fn sweep_cache(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.cache_ttl.as_secs();
        let before = self.cache.len();
        self.cache
            .retain(|_, cached| now.saturating_sub(cached.cached_at) < ttl);
        before - self.cache.len()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn cache_put(&self, info: NonceAccountInfo) {
        let cached_at = self.clock.now();
        self.cache
            .insert(info.address, CachedAccount { info, cached_at });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticGate;
    use crate::clock::ManualClock;
    use crate::config::SYSTEM_PROGRAM_ID;
    use crate::crypto::keys::DeviceKeypair;
    use crate::intent::Intent;
    use crate::ledger::{AccountState, LedgerError, LedgerRef, NonceAccountState};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const NOW: u64 = 1_700_000_000;

    #[derive(Default)]
    struct FakeLedger {
        accounts: Mutex<HashMap<PublicKey, NonceAccountState>>,
    }

    #[async_trait]
    impl LedgerClient for FakeLedger {
        async fn get_account_state(&self, _: &PublicKey) -> Result<AccountState, LedgerError> {
            Ok(AccountState {
                balance: 0,
                observed_nonce: 0,
            })
        }
        async fn get_recent_checkpoint(&self) -> Result<u64, LedgerError> {
            Ok(1)
        }
        async fn build_and_submit(&self, _: &Intent) -> Result<LedgerRef, LedgerError> {
            Err(LedgerError::Rpc("unused".into()))
        }
        async fn confirm(&self, _: &LedgerRef) -> Result<bool, LedgerError> {
            Ok(false)
        }
        async fn get_nonce_account(
            &self,
            address: &PublicKey,
        ) -> Result<Option<NonceAccountState>, LedgerError> {
            Ok(self.accounts.lock().get(address).cloned())
        }
        async fn create_nonce_account(
            &self,
            _owner: &PublicKey,
            authority: &PublicKey,
        ) -> Result<NonceAccountState, LedgerError> {
            let state = NonceAccountState {
                address: DeviceKeypair::generate().public_key(),
                authority: *authority,
                nonce: 1,
                owner_program: SYSTEM_PROGRAM_ID.into(),
            };
            self.accounts.lock().insert(state.address, state.clone());
            Ok(state)
        }
    }

    fn manager(
        gate: bool,
    ) -> (NonceAccountManager, Arc<FakeLedger>, ManualClock) {
        let ledger = Arc::new(FakeLedger::default());
        let clock = ManualClock::new(NOW);
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let mgr = NonceAccountManager::new(
            ledger.clone(),
            Arc::new(StaticGate(gate)),
            store,
            Arc::new(clock.clone()),
            Duration::from_secs(600),
            Duration::from_secs(3600),
        );
        (mgr, ledger, clock)
    }

    #[tokio::test]
    async fn create_requires_gate() {
        let (mgr, ledger, _) = manager(false);
        let owner = DeviceKeypair::generate().public_key();
        let err = mgr.create_nonce_account(&owner, &owner).await.unwrap_err();
        assert!(matches!(err, TossError::Authorization(_)));
        assert!(ledger.accounts.lock().is_empty());
    }

    #[tokio::test]
    async fn create_then_get_secure() {
        let (mgr, _, _) = manager(true);
        let owner = DeviceKeypair::generate().public_key();
        let info = mgr.create_nonce_account(&owner, &owner).await.unwrap();
        assert_eq!(info.status, NonceAccountStatus::Active);
        assert!(mgr.is_valid(&info));

        let fetched = mgr
            .get_secure(&info.address, || async { true })
            .await
            .unwrap();
        assert_eq!(fetched, Some(info.clone()));

        let denied = mgr
            .get_secure(&info.address, || async { false })
            .await
            .unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn renew_pulls_fresh_nonce() {
        let (mgr, ledger, clock) = manager(true);
        let owner = DeviceKeypair::generate().public_key();
        let info = mgr.create_nonce_account(&owner, &owner).await.unwrap();

        ledger
            .accounts
            .lock()
            .get_mut(&info.address)
            .unwrap()
            .nonce = 9;
        clock.advance(Duration::from_secs(5));

        let renewed = mgr.renew(&info.address).await.unwrap().unwrap();
        assert_eq!(renewed.current_nonce, 9);
        assert_eq!(renewed.last_modified, NOW + 5);
    }

    #[tokio::test]
    async fn renew_requires_gate() {
        let ledger = Arc::new(FakeLedger::default());
        let store = RecordStore::new(Arc::new(MemoryStore::new())).unwrap();
        let owner = DeviceKeypair::generate().public_key();
        let state = ledger.create_nonce_account(&owner, &owner).await.unwrap();
        let before = NonceAccountInfo {
            address: state.address,
            authorized_signer: owner,
            current_nonce: 1,
            last_used_nonce: 0,
            status: NonceAccountStatus::Active,
            created_at: NOW,
            last_modified: NOW,
        };
        store.put_nonce_account(&before).unwrap();
        ledger.accounts.lock().get_mut(&state.address).unwrap().nonce = 9;

        let mgr = NonceAccountManager::new(
            ledger,
            Arc::new(StaticGate(false)),
            store.clone(),
            Arc::new(ManualClock::new(NOW + 5)),
            Duration::from_secs(600),
            Duration::from_secs(3600),
        );
        let err = mgr.renew(&state.address).await.unwrap_err();
        assert!(matches!(err, TossError::Authorization(_)));
        assert_eq!(store.get_nonce_account(&state.address).unwrap(), Some(before));
        assert_eq!(mgr.cached_len(), 0);
    }

    #[tokio::test]
    async fn revoked_account_is_invalid() {
        let (mgr, _, _) = manager(true);
        let owner = DeviceKeypair::generate().public_key();
        let info = mgr.create_nonce_account(&owner, &owner).await.unwrap();

        mgr.revoke(&info.address).await.unwrap();
        let after = mgr.lookup(&info.address).unwrap().unwrap();
        assert_eq!(after.status, NonceAccountStatus::Revoked);
        assert!(!mgr.is_valid(&after));
        // renew leaves a revoked account alone
        let renewed = mgr.renew(&info.address).await.unwrap().unwrap();
        assert_eq!(renewed.status, NonceAccountStatus::Revoked);
    }

    #[tokio::test]
    async fn old_accounts_expire_by_policy() {
        let (mgr, _, clock) = manager(true);
        let owner = DeviceKeypair::generate().public_key();
        let info = mgr.create_nonce_account(&owner, &owner).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        assert!(!mgr.is_valid(&info));
    }

    #[tokio::test]
    async fn cache_sweep_keeps_account_readable() {
        let (mgr, _, clock) = manager(true);
        let owner = DeviceKeypair::generate().public_key();
        let info = mgr.create_nonce_account(&owner, &owner).await.unwrap();
        assert_eq!(mgr.cached_len(), 1);

        clock.advance(Duration::from_secs(601));
        assert_eq!(mgr.sweep_cache(), 1);
        assert_eq!(mgr.cached_len(), 0);
        assert!(mgr.lookup(&info.address).unwrap().is_some());
    }

    #[tokio::test]
    async fn consume_advances_last_used() {
        let (mgr, _, _) = manager(true);
        let owner = DeviceKeypair::generate().public_key();
        let info = mgr.create_nonce_account(&owner, &owner).await.unwrap();
        mgr.consume(&info.address, 7).unwrap();
        mgr.consume(&info.address, 3).unwrap();
        assert_eq!(mgr.lookup(&info.address).unwrap().unwrap().last_used_nonce, 7);
    }
}
