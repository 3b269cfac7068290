//! # ReconciliationEngine
//!
//! Runs when connectivity returns. One pass for one signer:
//!
//! ```text
//!  stored Pending/Failed intents (arrival order)
//!        │
//!        ▼
//!  1. validate ── expired? signature? ledger nonce (replay)? nonce account?
//!        │            └─ any failure ─► Rejected + reason
//!        ▼
//!  2. conflicts ── group by (sender, recipient, amount), resolve,
//!        │            └─ losers ─► Rejected "superseded-by-conflict-resolution"
//!        ▼
//!  3. settle ── balance (running, per pass) ─► submit ─► confirm
//!        │            ├─ confirmed ─► Settled + ledger ref
//!        │            └─ ledger trouble ─► Failed, retried next pass
//!        ▼
//!  4. persist SettlementResult per intent, update ReconciliationState
//! ```
//!
//! Account-state reads for all senders in the pass go out in parallel; the
//! order in which conflict groups are decided and intents settled stays
//! deterministic.
//!
//! At most one pass per signer runs at a time. A second caller gets
//! [`TossError::ReconciliationInProgress`] immediately instead of queueing.
//! The per-signer locks are shared through [`PassLocks`] so housekeeping
//! can leave a running pass's intents alone. If some other writer still
//! moves an intent to a terminal state mid-pass, the stored status stands
//! and the pass records the ledger outcome anyway.

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::conflict::{group_conflicts, resolve};
use super::state::{
    ConflictOutcome, ReconciliationReport, ReconciliationState, RejectionReason, SettlementResult,
    SettlementStatus,
};
use crate::clock::SharedClock;
use crate::config::SYSTEM_PROGRAM_ID;
use crate::crypto::keys::PublicKey;
use crate::error::{TossError, TossResult};
use crate::intent::{Intent, IntentCodec, IntentStatus, NonceLedger};
use crate::ledger::{AccountState, LedgerClient, LedgerError, LedgerRef};
use crate::nonce_account::NonceAccountManager;
use crate::storage::{RecordStore, StorageError};

/// Per-signer pass locks.
#[derive(Clone, Default)]
pub struct PassLocks(Arc<DashMap<PublicKey, Arc<Mutex<()>>>>);

impl PassLocks {
    fn lock_for(&self, signer: &PublicKey) -> Arc<Mutex<()>> {
        self.0
            .entry(*signer)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether a pass for `signer` is running right now.
    pub fn is_running(&self, signer: &PublicKey) -> bool {
        self.0
            .get(signer)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

pub struct ReconciliationEngine {
    ledger: Arc<dyn LedgerClient>,
    store: RecordStore,
    nonces: Arc<NonceLedger>,
    nonce_accounts: Option<Arc<NonceAccountManager>>,
    codec: IntentCodec,
    clock: SharedClock,
    passes: PassLocks,
}

/// Mutable bookkeeping for one pass.
struct Pass {
    state: ReconciliationState,
    results: Vec<SettlementResult>,
    now: u64,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: RecordStore,
        nonces: Arc<NonceLedger>,
        codec: IntentCodec,
        clock: SharedClock,
    ) -> Self {
        Self {
            ledger,
            store,
            nonces,
            nonce_accounts: None,
            codec,
            clock,
            passes: PassLocks::default(),
        }
    }

    pub fn pass_locks(&self) -> PassLocks {
        self.passes.clone()
    }

    /// Check intent nonce accounts against the manager's local status too.
    pub fn with_nonce_accounts(mut self, manager: Arc<NonceAccountManager>) -> Self {
        self.nonce_accounts = Some(manager);
        self
    }

    /// Reconcile every stored intent where `signer` is sender or recipient.
    pub async fn reconcile(&self, signer: &PublicKey) -> TossResult<ReconciliationReport> {
        let lock = self.passes.lock_for(signer);
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| TossError::ReconciliationInProgress(signer.to_base58()))?;

        let checkpoint = self.ledger.get_recent_checkpoint().await?;
        let candidates: Vec<Intent> = self
            .store
            .settleable_intents()?
            .into_iter()
            .filter(|i| i.sender == *signer || i.recipient == *signer)
            .collect();

        info!(signer = %signer, intents = candidates.len(), checkpoint, "reconciliation started");

        let mut pass = Pass {
            state: self
                .store
                .get_reconciliation_state(signer)?
                .unwrap_or_else(|| ReconciliationState::new(*signer)),
            results: Vec::new(),
            now: self.clock.now(),
        };

        let accounts = self.fetch_accounts(&candidates).await;

        // 1. validate
        let mut valid = Vec::with_capacity(candidates.len());
        for mut intent in candidates {
            if intent.is_expired_at(pass.now) {
                self.reject(&mut pass, &mut intent, RejectionReason::Expired, IntentStatus::Expired)?;
                continue;
            }

            let verification = self.codec.verify_signature(&intent);
            if let Some(why) = verification.reason {
                self.reject(&mut pass, &mut intent, RejectionReason::Invalid(why), IntentStatus::Rejected)?;
                continue;
            }

            let account = match accounts.get(&intent.sender) {
                Some(Ok(account)) => *account,
                Some(Err(e)) => {
                    self.defer(&mut pass, &intent, e.to_string())?;
                    continue;
                }
                None => {
                    self.defer(&mut pass, &intent, "account state unavailable".into())?;
                    continue;
                }
            };

            self.nonces.observe_ledger(&intent.sender, account.observed_nonce);
            if intent.nonce <= account.observed_nonce {
                warn!(
                    intent_id = %intent.id,
                    signer = %intent.sender,
                    nonce = intent.nonce,
                    observed = account.observed_nonce,
                    "replay detected during reconciliation"
                );
                let reason = RejectionReason::Replay {
                    nonce: intent.nonce,
                    observed: account.observed_nonce,
                };
                self.reject(&mut pass, &mut intent, reason, IntentStatus::Rejected)?;
                continue;
            }

            match self.check_nonce_account(&intent).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    self.reject(&mut pass, &mut intent, reason, IntentStatus::Rejected)?;
                    continue;
                }
                Err(e) => {
                    self.defer(&mut pass, &intent, e.to_string())?;
                    continue;
                }
            }

            valid.push(intent);
        }

        // 2. conflicts
        let mut conflicts = Vec::new();
        let mut losers: HashSet<String> = HashSet::new();
        for (key, group) in group_conflicts(&valid) {
            if group.len() < 2 {
                continue;
            }
            let Some(resolution) = resolve(&group) else {
                continue;
            };
            for intent in &group {
                pass.state.conflicting_intents.insert(intent.id.clone());
            }
            for loser in &resolution.losers {
                losers.insert(loser.id.clone());
            }
            info!(
                winner = %resolution.winner.id,
                losers = resolution.losers.len(),
                "conflict resolved"
            );
            conflicts.push(ConflictOutcome {
                key,
                winner: resolution.winner.id.clone(),
                losers: resolution.losers.iter().map(|i| i.id.clone()).collect(),
            });
        }
        let winner_of: HashMap<&str, &str> = conflicts
            .iter()
            .flat_map(|c| c.losers.iter().map(move |l| (l.as_str(), c.winner.as_str())))
            .collect();

        // 3. settle, in arrival order
        let mut balances: HashMap<PublicKey, u64> = accounts
            .iter()
            .filter_map(|(k, v)| v.as_ref().ok().map(|a| (*k, a.balance)))
            .collect();

        for mut intent in valid {
            if losers.contains(&intent.id) {
                let winner = winner_of
                    .get(intent.id.as_str())
                    .map(|w| w.to_string())
                    .unwrap_or_default();
                self.reject(
                    &mut pass,
                    &mut intent,
                    RejectionReason::Superseded { winner },
                    IntentStatus::Rejected,
                )?;
                continue;
            }

            let available = balances.get(&intent.sender).copied().unwrap_or(0);
            if intent.amount > available {
                let reason = RejectionReason::InsufficientBalance {
                    required: intent.amount,
                    available,
                };
                self.reject(&mut pass, &mut intent, reason, IntentStatus::Rejected)?;
                continue;
            }

            self.settle(&mut pass, &mut intent, &mut balances).await?;
        }

        // 4. state
        pass.state.last_sync_time = pass.now;
        pass.state.last_sync_checkpoint = checkpoint;
        self.store.put_reconciliation_state(&pass.state)?;
        let signers: BTreeSet<PublicKey> = accounts.keys().copied().collect();
        for s in &signers {
            self.nonces.persist(&self.store, s)?;
        }

        let report = ReconciliationReport {
            signer: *signer,
            checkpoint,
            results: pass.results,
            conflicts,
        };
        info!(
            signer = %signer,
            settled = report.count(SettlementStatus::Success),
            rejected = report.count(SettlementStatus::Rejected),
            failed = report.count(SettlementStatus::Failed),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn fetch_accounts(
        &self,
        intents: &[Intent],
    ) -> HashMap<PublicKey, Result<AccountState, LedgerError>> {
        let senders: BTreeSet<PublicKey> = intents.iter().map(|i| i.sender).collect();
        let ledger = &self.ledger;
        join_all(senders.into_iter().map(|sender| async move {
            let state = ledger.get_account_state(&sender).await;
            (sender, state)
        }))
        .await
        .into_iter()
        .collect()
    }

    async fn check_nonce_account(&self, intent: &Intent) -> TossResult<Option<RejectionReason>> {
        let Some(address) = intent.nonce_account_ref else {
            return Ok(None);
        };
        let Some(account) = self.ledger.get_nonce_account(&address).await? else {
            return Ok(Some(RejectionReason::NonceAccountMissing));
        };
        if account.owner_program != SYSTEM_PROGRAM_ID {
            return Ok(Some(RejectionReason::NonceAccountWrongOwner {
                owner: account.owner_program,
            }));
        }
        if account.authority != intent.sender {
            return Ok(Some(RejectionReason::NonceAccountAuthorityMismatch));
        }
        if let Some(manager) = &self.nonce_accounts {
            if let Some(info) = manager.lookup(&address)? {
                if !manager.is_valid(&info) {
                    return Ok(Some(RejectionReason::NonceAccountInactive));
                }
            }
        }
        Ok(None)
    }

    async fn settle(
        &self,
        pass: &mut Pass,
        intent: &mut Intent,
        balances: &mut HashMap<PublicKey, u64>,
    ) -> TossResult<()> {
        let ledger_ref = match self.ledger.build_and_submit(intent).await {
            Ok(r) => r,
            Err(e) => return self.fail(pass, intent, e.to_string(), None),
        };

        match self.ledger.confirm(&ledger_ref).await {
            Ok(true) => {}
            Ok(false) => {
                return self.fail(pass, intent, "settlement not confirmed".into(), Some(ledger_ref))
            }
            Err(e) => return self.fail(pass, intent, e.to_string(), Some(ledger_ref)),
        }

        if let Some(balance) = balances.get_mut(&intent.sender) {
            *balance = balance.saturating_sub(intent.amount);
        }
        self.nonces.observe_ledger(&intent.sender, intent.nonce);
        if let (Some(address), Some(manager)) = (intent.nonce_account_ref, &self.nonce_accounts) {
            if let Err(e) = manager.consume(&address, intent.nonce) {
                warn!(intent_id = %intent.id, error = %e, "could not record nonce account use");
            }
        }

        intent.transition(IntentStatus::Settled, None, pass.now);
        self.store_status(intent)?;
        info!(intent_id = %intent.id, ledger_ref = %ledger_ref, "intent settled");
        let result = SettlementResult::success(&intent.id, ledger_ref, pass.now);
        self.commit(pass, result)
    }

    /// Terminal rejection.
    fn reject(
        &self,
        pass: &mut Pass,
        intent: &mut Intent,
        reason: RejectionReason,
        status: IntentStatus,
    ) -> TossResult<()> {
        if !reason.is_replay() {
            info!(intent_id = %intent.id, reason = %reason, "intent rejected");
        }
        intent.transition(status, Some(reason.to_string()), pass.now);
        self.store_status(intent)?;
        let result = SettlementResult::rejected(&intent.id, reason, pass.now);
        self.commit(pass, result)
    }

    /// Ledger trouble after submission: the intent moves to `Failed` and is
    /// picked up again next pass.
    fn fail(
        &self,
        pass: &mut Pass,
        intent: &mut Intent,
        error: String,
        ledger_ref: Option<LedgerRef>,
    ) -> TossResult<()> {
        warn!(intent_id = %intent.id, error = %error, "settlement failed");
        intent.transition(IntentStatus::Failed, Some(error.clone()), pass.now);
        self.store_status(intent)?;
        let result = SettlementResult::failed(&intent.id, error, ledger_ref, pass.now);
        self.commit(pass, result)
    }

    /// Ledger trouble before submission: the intent is left exactly as it
    /// was, only the result is recorded.
    fn defer(&self, pass: &mut Pass, intent: &Intent, error: String) -> TossResult<()> {
        debug!(intent_id = %intent.id, error = %error, "validation deferred");
        let result = SettlementResult::failed(&intent.id, error, None, pass.now);
        self.commit(pass, result)
    }

    /// Write the intent's new status. When another writer has already made
    /// the stored copy terminal, that copy is kept and loaded into `intent`.
    fn store_status(&self, intent: &mut Intent) -> TossResult<()> {
        match self.store.put_intent(intent) {
            Ok(_) => Ok(()),
            Err(StorageError::Immutable { .. }) => {
                if let Some(stored) = self.store.get_intent(&intent.id)? {
                    warn!(
                        intent_id = %intent.id,
                        stored = %stored.status,
                        outcome = %intent.status,
                        "intent went terminal during the pass, keeping stored status"
                    );
                    *intent = stored;
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, pass: &mut Pass, result: SettlementResult) -> TossResult<()> {
        self.store.put_settlement(&result)?;
        pass.state.record(&result);
        pass.results.push(result);
        Ok(())
    }
}
