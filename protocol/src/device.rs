//! # OfflineDevice
//!
//! One device's engine, with every component wired together the way an
//! intent flows through the system:
//!
//! ```text
//!  create_intent ── NonceLedger + IntentCodec ──► RecordStore
//!        │
//!  offer ── ExchangeProtocol ── FragmentSender ──► TransportAdapter ~~~► peer
//!                                                                     │
//!  receive ◄── Inbox (reassemble, open) ◄───────────── raw frames ◄───┘
//!     ├── Hello / HelloReply ─► SessionManager::install
//!     ├── Request ─► verify, NonceLedger::accept, store, answer
//!     └── Response ─► ExchangeProtocol::record_response
//!
//!  reconcile ── ReconciliationEngine ──► LedgerClient
//! ```
//!
//! The device id other peers know us by is our base58 public key. Frames
//! from one peer are reassembled as a single stream, so messages toward a
//! given peer are sent one after another, never interleaved.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::CredentialGate;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, MAX_TRUST_SCORE};
use crate::crypto::handshake::SessionHandshake;
use crate::crypto::keys::{DeviceKeypair, PublicKey};
use crate::error::{TossError, TossResult};
use crate::exchange::{
    ExchangeProtocol, ExchangeRequest, ExchangeResponse, ExchangeStatus, PeerDevice,
    PeerRegistry, TransportKind, WireMessage,
};
use crate::housekeeping::Housekeeper;
use crate::intent::{
    ConfidentialEncryptor, Intent, IntentCodec, IntentExtras, IntentStatus, NonceLedger,
};
use crate::ledger::LedgerClient;
use crate::nonce_account::NonceAccountManager;
use crate::reconcile::{ReconciliationEngine, ReconciliationReport};
use crate::storage::{PersistentStore, RecordStore, StorageError};
use crate::transport::{
    Envelope, FragmentSender, Inbox, InboxEvent, ProgressFn, ReassemblyProgress, SendReport,
    SessionManager, TransportAdapter,
};

/// Trust adjustment after a peer hands us an intent we accept.
const TRUST_REWARD: i32 = 1;
/// Trust adjustment after a peer hands us an intent we reject.
const TRUST_PENALTY: i32 = -10;

const DUPLICATE_ID: &str = "duplicate intent id";

/// What a call to [`OfflineDevice::offer`] put on the wire.
#[derive(Debug, Clone)]
pub struct OfferReceipt {
    pub request: ExchangeRequest,
    pub report: SendReport,
}

/// What one received frame amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// More fragments needed.
    Partial(ReassemblyProgress),
    /// We answered a peer's hello; a session is installed on our side.
    HandshakeAnswered { peer_id: String },
    /// Our own handshake completed.
    SessionEstablished { peer_id: String },
    /// A peer offered an intent and we answered. `delivered` is false when
    /// the answer could not be sent back.
    Answered {
        response: ExchangeResponse,
        delivered: bool,
    },
    /// A peer answered one of our requests.
    ResponseRecorded(ExchangeResponse),
}

pub struct OfflineDevice {
    keypair: DeviceKeypair,
    id: String,
    config: EngineConfig,
    clock: SharedClock,
    store: RecordStore,
    ledger: Arc<dyn LedgerClient>,
    codec: IntentCodec,
    nonces: Arc<NonceLedger>,
    nonce_accounts: Arc<NonceAccountManager>,
    peers: Arc<PeerRegistry>,
    sessions: Arc<SessionManager>,
    inbox: Arc<Inbox>,
    sender: FragmentSender,
    exchange: Arc<ExchangeProtocol>,
    engine: ReconciliationEngine,
    encryptor: Option<Arc<dyn ConfidentialEncryptor>>,
    handshakes: DashMap<String, SessionHandshake>,
}

impl OfflineDevice {
    /// Assemble a device. Nonce state persisted in `backend` is reloaded.
    pub fn new(
        keypair: DeviceKeypair,
        config: EngineConfig,
        clock: SharedClock,
        backend: Arc<dyn PersistentStore>,
        ledger: Arc<dyn LedgerClient>,
        transport: Arc<dyn TransportAdapter>,
        gate: Arc<dyn CredentialGate>,
    ) -> TossResult<Self> {
        let store = RecordStore::new(backend)?;
        let codec = IntentCodec::new(clock.clone());
        let nonces = Arc::new(NonceLedger::load(&store)?);
        let nonce_accounts = Arc::new(NonceAccountManager::new(
            ledger.clone(),
            gate,
            store.clone(),
            clock.clone(),
            config.nonce_cache_ttl(),
            config.nonce_account_max_age(),
        ));
        let peers = Arc::new(PeerRegistry::new(
            clock.clone(),
            config.peer_timeout(),
            config.max_peers,
        ));
        let sessions = Arc::new(SessionManager::new(
            clock.clone(),
            config.session_ttl(),
            config.max_sessions,
        ));
        let inbox = Arc::new(Inbox::new(
            sessions.clone(),
            clock.clone(),
            config.reassembly_timeout(),
            config.max_checksum_failures,
        ));
        let sender = FragmentSender::new(transport, config.retry, config.mtu);
        let exchange = Arc::new(ExchangeProtocol::new(
            peers.clone(),
            sessions.clone(),
            codec.clone(),
            clock.clone(),
            config.exchange_ttl(),
        ));
        let engine = ReconciliationEngine::new(
            ledger.clone(),
            store.clone(),
            nonces.clone(),
            codec.clone(),
            clock.clone(),
        )
        .with_nonce_accounts(nonce_accounts.clone());

        let id = keypair.public_key().to_base58();
        info!(device_id = %id, mtu = config.mtu, "device engine ready");

        Ok(Self {
            keypair,
            id,
            config,
            clock,
            store,
            ledger,
            codec,
            nonces,
            nonce_accounts,
            peers,
            sessions,
            inbox,
            sender,
            exchange,
            engine,
            encryptor: None,
            handshakes: DashMap::new(),
        })
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn ConfidentialEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn codec(&self) -> &IntentCodec {
        &self.codec
    }

    pub fn nonces(&self) -> &Arc<NonceLedger> {
        &self.nonces
    }

    pub fn nonce_accounts(&self) -> &Arc<NonceAccountManager> {
        &self.nonce_accounts
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn exchange(&self) -> &Arc<ExchangeProtocol> {
        &self.exchange
    }

    /// A housekeeper covering every component of this device.
    pub fn housekeeper(&self) -> Housekeeper {
        Housekeeper::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.intent_retention(),
        )
        .with_peers(self.peers.clone())
        .with_sessions(self.sessions.clone())
        .with_inbox(self.inbox.clone())
        .with_exchange(self.exchange.clone())
        .with_nonce_accounts(self.nonce_accounts.clone())
        .with_pass_locks(self.engine.pass_locks())
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    /// Issue a nonce, sign a new intent to `recipient` and store it.
    ///
    /// If the ledger cannot be reached the nonce comes from local state alone
    /// and the intent is flagged `replay_unverified`.
    pub async fn create_intent(
        &self,
        recipient: PublicKey,
        amount: u64,
        expiry: u64,
        extras: IntentExtras,
    ) -> TossResult<Intent> {
        if let Some(id) = &extras.id {
            if self.store.get_intent(id)?.is_some() {
                return Err(TossError::Conflict(format!("intent id {} is already in use", id)));
            }
        }

        let signer = self.public_key();
        let issued = self
            .nonces
            .issue_with_ledger(&signer, self.ledger.as_ref())
            .await;

        let mut intent = self
            .codec
            .create(&self.keypair, recipient, amount, issued.nonce, expiry, extras)?;
        intent.replay_unverified = !issued.verified;

        match self.store.put_intent(&intent) {
            Ok(_) => {}
            Err(StorageError::IdCollision { key }) => {
                return Err(TossError::Conflict(format!("{} is already in use", key)))
            }
            Err(e) => return Err(e.into()),
        }
        self.nonces.persist(&self.store, &signer)?;
        info!(
            intent_id = %intent.id,
            nonce = intent.nonce,
            amount,
            verified = issued.verified,
            "intent created"
        );
        Ok(intent)
    }

    /// Like [`create_intent`](Self::create_intent), with `values` encrypted
    /// by the confidential-compute service and attached to the intent.
    pub async fn create_confidential_intent(
        &self,
        recipient: PublicKey,
        amount: u64,
        expiry: u64,
        program_ref: &str,
        values: &[u64],
    ) -> TossResult<Intent> {
        let encryptor = self
            .encryptor
            .as_ref()
            .ok_or_else(|| TossError::Validation("no confidential encryptor configured".into()))?;
        let payload = encryptor
            .encrypt(program_ref, values)
            .await
            .map_err(|e| TossError::Crypto(e.to_string()))?;
        let extras = IntentExtras {
            encrypted_payload: Some(payload),
            ..Default::default()
        };
        self.create_intent(recipient, amount, expiry, extras).await
    }

    // -----------------------------------------------------------------------
    // Peers and sessions
    // -----------------------------------------------------------------------

    /// Record a sighting from the radio layer.
    pub fn discover(
        &self,
        peer_id: &str,
        transport: TransportKind,
        signal_strength: Option<i16>,
    ) -> PeerDevice {
        self.peers.register(peer_id, transport, signal_strength)
    }

    /// Start key agreement with `peer_id`. The session is installed when the
    /// peer's reply comes back through [`receive`](Self::receive).
    pub async fn begin_handshake(&self, peer_id: &str) -> TossResult<SendReport> {
        let (handshake, hello) = SessionHandshake::initiate(&self.keypair);
        self.handshakes.insert(peer_id.to_string(), handshake);
        debug!(peer_id, session_id = %hello.session_id, "handshake started");
        self.send_message(peer_id, &WireMessage::Hello(hello), None)
            .await
    }

    // -----------------------------------------------------------------------
    // Exchange
    // -----------------------------------------------------------------------

    /// Offer a stored intent to `peer_id`.
    pub async fn offer(
        &self,
        intent_id: &str,
        peer_id: &str,
        use_encryption: bool,
        progress: Option<ProgressFn<'_>>,
    ) -> TossResult<OfferReceipt> {
        let intent = self
            .store
            .get_intent(intent_id)?
            .ok_or_else(|| TossError::NotFound(format!("intent {}", intent_id)))?;
        let request =
            self.exchange
                .create_request(&intent, &self.id, Some(peer_id), use_encryption)?;

        let report = self
            .send_message(peer_id, &WireMessage::Request(request.clone()), progress)
            .await?;
        self.exchange.mark_sent(&request.request_id)?;
        info!(
            intent_id,
            peer_id,
            request_id = %request.request_id,
            encrypted = request.encrypted,
            fragments = report.total,
            "intent offered"
        );
        Ok(OfferReceipt { request, report })
    }

    /// Feed one raw frame received from `peer_id`.
    pub async fn receive(&self, peer_id: &str, frame: &[u8]) -> TossResult<ReceiveOutcome> {
        let message = match self.inbox.ingest(peer_id, frame)? {
            InboxEvent::Partial(progress) => return Ok(ReceiveOutcome::Partial(progress)),
            InboxEvent::Message(message) => message,
        };
        self.peers.touch(peer_id);

        match WireMessage::decode(&message.body)? {
            WireMessage::Hello(hello) => {
                let (reply, agreed) = SessionHandshake::respond(&hello, &self.keypair)?;
                self.sessions
                    .install(peer_id, agreed.session_id, agreed.key)?;
                self.send_message(peer_id, &WireMessage::HelloReply(reply), None)
                    .await?;
                info!(peer_id, peer_key = %agreed.peer, "session agreed as responder");
                Ok(ReceiveOutcome::HandshakeAnswered {
                    peer_id: peer_id.to_string(),
                })
            }
            WireMessage::HelloReply(reply) => {
                let (_, mut handshake) = self
                    .handshakes
                    .remove(peer_id)
                    .ok_or_else(|| TossError::NotFound(format!("handshake with {}", peer_id)))?;
                let agreed = handshake.complete(&reply)?;
                self.sessions
                    .install(peer_id, agreed.session_id, agreed.key)?;
                info!(peer_id, peer_key = %agreed.peer, "session agreed as initiator");
                Ok(ReceiveOutcome::SessionEstablished {
                    peer_id: peer_id.to_string(),
                })
            }
            WireMessage::Request(request) => self.answer(peer_id, request).await,
            WireMessage::Response(response) => {
                self.exchange.record_response(&response)?;
                info!(
                    peer_id,
                    request_id = %response.request_id,
                    status = %response.status,
                    "exchange answered by peer"
                );
                Ok(ReceiveOutcome::ResponseRecorded(response))
            }
        }
    }

    async fn answer(&self, peer_id: &str, request: ExchangeRequest) -> TossResult<ReceiveOutcome> {
        let request_id = request.request_id.clone();
        self.exchange.accept_incoming(request)?;

        let (status, reason) = match self.exchange.resolve_request(&request_id, Some(peer_id)) {
            None => (
                ExchangeStatus::Rejected,
                Some("request could not be opened".to_string()),
            ),
            Some(resolved) => match resolved.intent() {
                Some(intent) => self.admit(intent)?,
                None => (
                    ExchangeStatus::Rejected,
                    Some("request carries no intent".to_string()),
                ),
            },
        };

        let delta = match status {
            ExchangeStatus::Accepted => TRUST_REWARD,
            ExchangeStatus::Rejected => TRUST_PENALTY,
            ExchangeStatus::Deferred => 0,
        };
        self.peers.update_trust(peer_id, delta, MAX_TRUST_SCORE);

        let response = self.exchange.respond(&request_id, status, reason)?;
        let delivered = match self
            .send_message(peer_id, &WireMessage::Response(response.clone()), None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(peer_id, request_id = %request_id, error = %e, "could not deliver exchange response");
                false
            }
        };
        Ok(ReceiveOutcome::Answered {
            response,
            delivered,
        })
    }

    /// Decide on an intent a peer offered. Storage failures propagate; every
    /// other problem becomes a rejection with a reason.
    fn admit(&self, intent: &Intent) -> TossResult<(ExchangeStatus, Option<String>)> {
        let verification = self.codec.verify(intent);
        if let Some(why) = verification.reason {
            info!(intent_id = %intent.id, reason = %why, "offered intent refused");
            return Ok((ExchangeStatus::Rejected, Some(why.to_string())));
        }

        if let Some(held) = self.store.get_intent(&intent.id)? {
            if !held.same_signed_content(intent) {
                warn!(intent_id = %intent.id, sender = %intent.sender, "offered intent reuses a stored id");
                return Ok((ExchangeStatus::Rejected, Some(DUPLICATE_ID.to_string())));
            }
        }

        let mut stored = intent.clone();
        stored.status = IntentStatus::Pending;
        stored.status_reason = None;
        let admitted = self.nonces.accept_with(&intent.sender, intent.nonce, || {
            self.store.put_intent(&stored)?;
            Ok(())
        });
        match admitted {
            Ok(()) => {}
            Err(e @ TossError::Replay { .. }) => {
                return Ok((ExchangeStatus::Rejected, Some(e.to_string())))
            }
            Err(TossError::Storage(StorageError::IdCollision { .. })) => {
                return Ok((ExchangeStatus::Rejected, Some(DUPLICATE_ID.to_string())))
            }
            Err(TossError::Storage(StorageError::Immutable { .. })) => {
                return Ok((
                    ExchangeStatus::Rejected,
                    Some("intent already final here".to_string()),
                ))
            }
            Err(e) => return Err(e),
        }
        self.nonces.persist(&self.store, &intent.sender)?;
        info!(intent_id = %intent.id, sender = %intent.sender, amount = intent.amount, "offered intent stored");
        Ok((ExchangeStatus::Accepted, None))
    }

    /// Encode, wrap in an envelope (sealed whenever a live session exists)
    /// and send.
    async fn send_message(
        &self,
        peer_id: &str,
        message: &WireMessage,
        progress: Option<ProgressFn<'_>>,
    ) -> TossResult<SendReport> {
        let bytes = message.encode()?;
        let sealable = matches!(message, WireMessage::Request(_) | WireMessage::Response(_));
        let envelope = match self.sessions.get_secure_session(peer_id) {
            Some(session) if sealable => Envelope::seal(&session, &bytes)?,
            _ => Envelope::plain(bytes),
        };
        let message_id = Uuid::new_v4().to_string();
        Ok(self
            .sender
            .send_envelope(peer_id, &message_id, &envelope, progress)
            .await?)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Settle every stored intent this device signed or receives.
    pub async fn reconcile(&self) -> TossResult<ReconciliationReport> {
        self.engine.reconcile(&self.public_key()).await
    }

    /// Reconcile on behalf of another signer whose intents this device holds.
    pub async fn reconcile_signer(&self, signer: &PublicKey) -> TossResult<ReconciliationReport> {
        self.engine.reconcile(signer).await
    }
}
