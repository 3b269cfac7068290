//! End-to-end tests for the offline intent engine.
//!
//! Two devices talk over an in-memory link; frames queue up and are pumped
//! into the receiving device by hand, so every test controls exactly what
//! arrives when. The ledger is a shared fake. Time is a manual clock.
//!
//! Each test builds its own devices. No shared state between tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use toss_protocol::auth::StaticGate;
use toss_protocol::clock::{ManualClock, SharedClock};
use toss_protocol::config::EngineConfig;
use toss_protocol::crypto::keys::{DeviceKeypair, PublicKey};
use toss_protocol::exchange::{ExchangeStatus, RequestState, TransportKind};
use toss_protocol::intent::{Intent, IntentExtras, IntentStatus};
use toss_protocol::ledger::{AccountState, LedgerClient, LedgerError, LedgerRef, NonceAccountState};
use toss_protocol::reconcile::{RejectionReason, SettlementStatus};
use toss_protocol::storage::{MemoryStore, PersistentStore, SledStore};
use toss_protocol::transport::{ProgressFn, TransportAdapter, TransportError, TransportIoError};
use toss_protocol::{OfflineDevice, ReceiveOutcome, TossError};

const NOW: u64 = 1_700_000_000;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Frame {
    from: String,
    to: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Net {
    queue: Mutex<VecDeque<Frame>>,
}

/// One device's end of the in-memory link.
struct Port {
    name: String,
    net: Arc<Net>,
    /// Frames carrying this fragment index never get through.
    drop_index: Option<u16>,
}

#[async_trait]
impl TransportAdapter for Port {
    async fn send(&self, peer_id: &str, bytes: &[u8]) -> Result<(), TransportIoError> {
        let index = u16::from_be_bytes([bytes[0], bytes[1]]);
        if self.drop_index == Some(index) {
            return Err(TransportIoError::Link(format!("fragment {} lost", index)));
        }
        self.net.queue.lock().push_back(Frame {
            from: self.name.clone(),
            to: peer_id.to_string(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct FakeLedger {
    accounts: Mutex<HashMap<PublicKey, AccountState>>,
    submitted: Mutex<Vec<String>>,
    offline: Mutex<bool>,
}

impl FakeLedger {
    fn fund(&self, key: PublicKey, balance: u64, observed_nonce: u64) {
        self.accounts.lock().insert(
            key,
            AccountState {
                balance,
                observed_nonce,
            },
        );
    }

    fn check_online(&self) -> Result<(), LedgerError> {
        if *self.offline.lock() {
            Err(LedgerError::Unavailable("no connectivity".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn get_account_state(&self, signer: &PublicKey) -> Result<AccountState, LedgerError> {
        self.check_online()?;
        Ok(self.accounts.lock().get(signer).copied().unwrap_or(AccountState {
            balance: 0,
            observed_nonce: 0,
        }))
    }

    async fn get_recent_checkpoint(&self) -> Result<u64, LedgerError> {
        self.check_online()?;
        Ok(9_000)
    }

    async fn build_and_submit(&self, intent: &Intent) -> Result<LedgerRef, LedgerError> {
        self.check_online()?;
        self.submitted.lock().push(intent.id.clone());
        Ok(LedgerRef(format!("sig-{}", intent.id)))
    }

    async fn confirm(&self, _: &LedgerRef) -> Result<bool, LedgerError> {
        self.check_online()?;
        Ok(true)
    }

    async fn get_nonce_account(
        &self,
        _: &PublicKey,
    ) -> Result<Option<NonceAccountState>, LedgerError> {
        self.check_online()?;
        Ok(None)
    }

    async fn create_nonce_account(
        &self,
        _: &PublicKey,
        _: &PublicKey,
    ) -> Result<NonceAccountState, LedgerError> {
        Err(LedgerError::Rejected("not supported by the fake".into()))
    }
}

struct World {
    net: Arc<Net>,
    ledger: Arc<FakeLedger>,
    clock: ManualClock,
    alice: OfflineDevice,
    bob: OfflineDevice,
}

fn device(
    name: &str,
    world_net: &Arc<Net>,
    ledger: &Arc<FakeLedger>,
    clock: &ManualClock,
    config: EngineConfig,
    drop_index: Option<u16>,
    backend: Arc<dyn PersistentStore>,
) -> OfflineDevice {
    let shared: SharedClock = Arc::new(clock.clone());
    OfflineDevice::new(
        DeviceKeypair::generate(),
        config,
        shared,
        backend,
        ledger.clone(),
        Arc::new(Port {
            name: name.to_string(),
            net: world_net.clone(),
            drop_index,
        }),
        Arc::new(StaticGate(true)),
    )
    .expect("device")
}

fn world_with(config: EngineConfig, alice_drops: Option<u16>) -> World {
    let net = Arc::new(Net::default());
    let ledger = Arc::new(FakeLedger::default());
    let clock = ManualClock::new(NOW);
    let alice = device(
        "alice",
        &net,
        &ledger,
        &clock,
        config.clone(),
        alice_drops,
        Arc::new(MemoryStore::new()),
    );
    let bob = device(
        "bob",
        &net,
        &ledger,
        &clock,
        config,
        None,
        Arc::new(MemoryStore::new()),
    );
    alice.discover("bob", TransportKind::Ble, Some(-55));
    bob.discover("alice", TransportKind::Ble, Some(-58));
    ledger.fund(alice.public_key(), 5_000_000, 0);
    World {
        net,
        ledger,
        clock,
        alice,
        bob,
    }
}

fn world() -> World {
    // small MTU so every message spans several fragments
    world_with(
        EngineConfig {
            mtu: 96,
            ..Default::default()
        },
        None,
    )
}

/// Deliver queued frames until the link is quiet. Returns every non-partial
/// outcome as `(receiver, outcome)`.
async fn pump(w: &World) -> Vec<(String, ReceiveOutcome)> {
    let mut outcomes = Vec::new();
    loop {
        let next = w.net.queue.lock().pop_front();
        let Some(frame) = next else { break };
        let device = if frame.to == "alice" { &w.alice } else { &w.bob };
        let outcome = device
            .receive(&frame.from, &frame.bytes)
            .await
            .expect("receive");
        if !matches!(outcome, ReceiveOutcome::Partial(_)) {
            outcomes.push((frame.to, outcome));
        }
    }
    outcomes
}

fn answered(outcomes: &[(String, ReceiveOutcome)]) -> (ExchangeStatus, Option<String>) {
    outcomes
        .iter()
        .find_map(|(_, o)| match o {
            ReceiveOutcome::Answered { response, .. } => {
                Some((response.status, response.reason.clone()))
            }
            _ => None,
        })
        .expect("an answered request")
}

// ---------------------------------------------------------------------------
// Full flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_sealed_offer_and_settlement() {
    let w = world();

    // key agreement
    w.alice.begin_handshake("bob").await.unwrap();
    let outcomes = pump(&w).await;
    assert!(outcomes.contains(&(
        "bob".into(),
        ReceiveOutcome::HandshakeAnswered {
            peer_id: "alice".into()
        }
    )));
    assert!(outcomes.contains(&(
        "alice".into(),
        ReceiveOutcome::SessionEstablished {
            peer_id: "bob".into()
        }
    )));

    // create and offer
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 1_000_000, NOW + 3600, IntentExtras::default())
        .await
        .unwrap();
    assert_eq!(intent.nonce, 1);
    assert!(!intent.replay_unverified);

    let calls = AtomicUsize::new(0);
    let on_progress = |_sent: u16, _total: u16, _id: &str| {
        calls.fetch_add(1, Ordering::SeqCst);
    };
    let progress: ProgressFn = &on_progress;
    let receipt = w
        .alice
        .offer(&intent.id, "bob", true, Some(progress))
        .await
        .unwrap();
    assert!(receipt.request.encrypted);
    assert!(!receipt.request.plaintext_fallback);
    assert!(receipt.report.total > 1);
    assert_eq!(calls.load(Ordering::SeqCst), receipt.report.total as usize);

    // deliver, answer, record
    let outcomes = pump(&w).await;
    assert_eq!(answered(&outcomes), (ExchangeStatus::Accepted, None));
    assert!(outcomes.iter().any(|(to, o)| to == "alice"
        && matches!(o, ReceiveOutcome::ResponseRecorded(r) if r.acknowledged == vec![intent.id.clone()])));
    assert_eq!(
        w.alice.exchange().state(&receipt.request.request_id),
        Some(RequestState::Acked(ExchangeStatus::Accepted))
    );

    let held = w.bob.store().get_intent(&intent.id).unwrap().unwrap();
    assert_eq!(held.status, IntentStatus::Pending);
    assert!(w.bob.codec().verify(&held).valid);

    // bob comes online first and settles
    let report = w.bob.reconcile().await.unwrap();
    let result = report.result_for(&intent.id).unwrap();
    assert_eq!(result.status, SettlementStatus::Success);
    assert_eq!(
        result.ledger_ref,
        Some(LedgerRef(format!("sig-{}", intent.id)))
    );
    assert_eq!(
        w.bob.store().get_intent(&intent.id).unwrap().unwrap().status,
        IntentStatus::Settled
    );
    assert_eq!(*w.ledger.submitted.lock(), vec![intent.id.clone()]);
}

#[tokio::test]
async fn plaintext_offer_is_flagged_when_no_session_can_be_sealed() {
    let w = world();
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();

    let receipt = w.alice.offer(&intent.id, "bob", false, None).await.unwrap();
    assert!(!receipt.request.encrypted);
    assert!(!receipt.request.plaintext_fallback);

    let outcomes = pump(&w).await;
    assert_eq!(answered(&outcomes).0, ExchangeStatus::Accepted);
}

#[tokio::test]
async fn sealed_offer_without_handshake_is_refused_not_leaked() {
    let w = world();
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();

    // alice seals under a key bob never agreed to
    let receipt = w.alice.offer(&intent.id, "bob", true, None).await;
    assert!(receipt.is_ok());

    let frame_count = w.net.queue.lock().len();
    assert!(frame_count > 0);
    let mut last = None;
    loop {
        let next = w.net.queue.lock().pop_front();
        let Some(frame) = next else { break };
        if frame.to != "bob" {
            continue;
        }
        last = Some(w.bob.receive(&frame.from, &frame.bytes).await);
    }
    // the envelope itself is sealed and bob holds no session for alice
    assert!(matches!(
        last,
        Some(Err(TossError::Transport(TransportError::NoSession(_))))
    ));
    assert!(w.bob.store().get_intent(&intent.id).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Replay protection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offering_the_same_intent_twice_is_a_replay() {
    let w = world();
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();

    w.alice.offer(&intent.id, "bob", false, None).await.unwrap();
    assert_eq!(answered(&pump(&w).await).0, ExchangeStatus::Accepted);

    w.alice.offer(&intent.id, "bob", false, None).await.unwrap();
    let (status, reason) = answered(&pump(&w).await);
    assert_eq!(status, ExchangeStatus::Rejected);
    assert!(reason.unwrap().contains("replay"));

    // one reward, one penalty
    assert_eq!(w.bob.peers().get("alice").unwrap().trust_score, 50 + 1 - 10);
}

#[tokio::test]
async fn intent_reusing_a_stored_id_cannot_replace_it() {
    let w = world();
    let original = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();
    w.alice.offer(&original.id, "bob", false, None).await.unwrap();
    assert_eq!(answered(&pump(&w).await).0, ExchangeStatus::Accepted);

    let mallory = device(
        "mallory",
        &w.net,
        &w.ledger,
        &w.clock,
        EngineConfig {
            mtu: 96,
            ..Default::default()
        },
        None,
        Arc::new(MemoryStore::new()),
    );
    mallory.discover("bob", TransportKind::Ble, Some(-60));
    w.bob.discover("mallory", TransportKind::Ble, Some(-60));

    let forged = mallory
        .create_intent(
            w.bob.public_key(),
            7,
            NOW + 600,
            IntentExtras {
                id: Some(original.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(mallory.codec().verify(&forged).valid);
    mallory.offer(&forged.id, "bob", false, None).await.unwrap();

    // only bob's side of the link matters here
    let mut outcomes = Vec::new();
    loop {
        let next = w.net.queue.lock().pop_front();
        let Some(frame) = next else { break };
        if frame.to != "bob" {
            continue;
        }
        let outcome = w.bob.receive(&frame.from, &frame.bytes).await.unwrap();
        outcomes.push((frame.to, outcome));
    }
    let (status, reason) = answered(&outcomes);
    assert_eq!(status, ExchangeStatus::Rejected);
    assert_eq!(reason.as_deref(), Some("duplicate intent id"));

    let held = w.bob.store().get_intent(&original.id).unwrap().unwrap();
    assert_eq!(held.sender, w.alice.public_key());
    assert_eq!(held.amount, 10);
    // mallory's nonce was never recorded, so a fresh intent still gets in
    assert_eq!(w.bob.nonces().highest(&mallory.public_key()), 0);
}

#[tokio::test]
async fn local_id_collision_is_reported_as_conflict() {
    let w = world();
    let first = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();

    let err = w
        .alice
        .create_intent(
            w.bob.public_key(),
            20,
            NOW + 600,
            IntentExtras {
                id: Some(first.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TossError::Conflict(_)));
    assert_eq!(w.alice.store().get_intent(&first.id).unwrap().unwrap().amount, 10);
}

#[tokio::test]
async fn ledger_nonce_at_or_above_intent_nonce_rejects_every_run() {
    let w = world();

    // created while offline: local nonce only
    *w.ledger.offline.lock() = true;
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();
    assert!(intent.replay_unverified);
    assert_eq!(intent.nonce, 1);

    // meanwhile another device of alice's used nonces up to 10
    *w.ledger.offline.lock() = false;
    w.ledger.fund(w.alice.public_key(), 5_000_000, 10);

    for _ in 0..2 {
        w.alice.reconcile().await.unwrap();
        let stored = w.alice.store().get_intent(&intent.id).unwrap().unwrap();
        assert_eq!(stored.status, IntentStatus::Rejected);
        let settlement = w.alice.store().get_settlement(&intent.id).unwrap().unwrap();
        assert_eq!(
            settlement.reason,
            Some(RejectionReason::Replay {
                nonce: 1,
                observed: 10
            })
        );
    }
    assert!(w.ledger.submitted.lock().is_empty());

    // the next nonce issued clears the ledger's value
    let next = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();
    assert_eq!(next.nonce, 11);
}

#[tokio::test]
async fn offline_reconcile_leaves_intents_for_later() {
    let w = world();
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();

    *w.ledger.offline.lock() = true;
    assert!(matches!(w.alice.reconcile().await, Err(TossError::Ledger(_))));
    assert_eq!(
        w.alice.store().get_intent(&intent.id).unwrap().unwrap().status,
        IntentStatus::Pending
    );

    *w.ledger.offline.lock() = false;
    let report = w.alice.reconcile().await.unwrap();
    assert_eq!(report.count(SettlementStatus::Success), 1);
}

// ---------------------------------------------------------------------------
// Transport behaviour
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lost_fragment_is_reported_by_index() {
    let w = world_with(
        EngineConfig {
            mtu: 64,
            ..Default::default()
        },
        Some(3),
    );
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 600, IntentExtras::default())
        .await
        .unwrap();

    match w.alice.offer(&intent.id, "bob", false, None).await {
        Err(TossError::Transport(TransportError::Incomplete(report))) => {
            assert_eq!(report.failed_fragments, vec![3]);
            assert!(!report.success());
            assert_eq!(report.sent_fragments.len() as u16, report.total - 1);
            assert!(!report.sent_fragments.contains(&3));
        }
        other => panic!("expected an incomplete send, got {:?}", other.map(|r| r.report)),
    }

    // bob never completes the message
    let outcomes = pump(&w).await;
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn session_expires_and_is_replaced_transparently() {
    let w = world();
    let first = w.alice.sessions().get_or_establish("bob").unwrap();

    w.clock.advance(Duration::from_secs(31 * 60));
    assert!(w.alice.sessions().get_secure_session("bob").is_none());

    let second = w.alice.sessions().get_or_establish("bob").unwrap();
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn housekeeping_clears_stale_state() {
    let w = world();
    let intent = w
        .alice
        .create_intent(w.bob.public_key(), 10, NOW + 60, IntentExtras::default())
        .await
        .unwrap();
    w.alice.sessions().get_or_establish("bob").unwrap();

    w.clock.advance(Duration::from_secs(31 * 60));
    let report = w.alice.housekeeper().sweep().unwrap();
    assert_eq!(report.expired_intents, 1);
    assert_eq!(report.peers, 1);
    assert_eq!(report.sessions, 1);
    assert_eq!(
        w.alice.store().get_intent(&intent.id).unwrap().unwrap().status,
        IntentStatus::Expired
    );
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sled_backed_device_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(Net::default());
    let ledger = Arc::new(FakeLedger::default());
    let clock = ManualClock::new(NOW);
    let recipient = DeviceKeypair::generate().public_key();

    let intent = {
        let backend = Arc::new(SledStore::open(dir.path()).unwrap());
        let dev = device(
            "alice",
            &net,
            &ledger,
            &clock,
            EngineConfig::default(),
            None,
            backend,
        );
        dev.create_intent(recipient, 10, NOW + 600, IntentExtras::default())
            .await
            .unwrap()
    };

    let backend = Arc::new(SledStore::open(dir.path()).unwrap());
    let dev = device(
        "alice",
        &net,
        &ledger,
        &clock,
        EngineConfig::default(),
        None,
        backend,
    );
    assert_eq!(dev.store().get_intent(&intent.id).unwrap(), Some(intent));
}
