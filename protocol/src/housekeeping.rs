//! # Housekeeping
//!
//! Periodic cleanup for a device engine. Each sweep:
//!
//! - marks stored `Pending`/`Failed` intents past their expiry as `Expired`,
//!   except those whose signer has a reconciliation pass running;
//! - deletes terminal intents once `expiry + retention` has passed, along
//!   with their settlement records;
//! - purges stale peers, expired sessions, idle reassembly buffers, expired
//!   exchange requests and old nonce-account cache entries.
//!
//! [`Housekeeper::run`] repeats the sweep on an interval until the shutdown
//! channel fires, the same way the node's other background loops stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::TossResult;
use crate::exchange::{ExchangeProtocol, PeerRegistry};
use crate::intent::{Intent, IntentStatus};
use crate::nonce_account::NonceAccountManager;
use crate::reconcile::PassLocks;
use crate::storage::RecordStore;
use crate::transport::{Inbox, SessionManager};

/// What one sweep removed or changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_intents: usize,
    pub deleted_intents: usize,
    pub deleted_settlements: usize,
    pub peers: usize,
    pub sessions: usize,
    pub reassembly_buffers: usize,
    pub requests: usize,
    pub nonce_cache: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Housekeeper {
    store: RecordStore,
    clock: SharedClock,
    retention: Duration,
    peers: Option<Arc<PeerRegistry>>,
    sessions: Option<Arc<SessionManager>>,
    inbox: Option<Arc<Inbox>>,
    exchange: Option<Arc<ExchangeProtocol>>,
    nonce_accounts: Option<Arc<NonceAccountManager>>,
    pass_locks: Option<PassLocks>,
}

impl Housekeeper {
    pub fn new(store: RecordStore, clock: SharedClock, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
            peers: None,
            sessions: None,
            inbox: None,
            exchange: None,
            nonce_accounts: None,
            pass_locks: None,
        }
    }

    pub fn with_peers(mut self, peers: Arc<PeerRegistry>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_inbox(mut self, inbox: Arc<Inbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn with_exchange(mut self, exchange: Arc<ExchangeProtocol>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_nonce_accounts(mut self, manager: Arc<NonceAccountManager>) -> Self {
        self.nonce_accounts = Some(manager);
        self
    }

    pub fn with_pass_locks(mut self, locks: PassLocks) -> Self {
        self.pass_locks = Some(locks);
        self
    }

    fn in_reconciliation(&self, intent: &Intent) -> bool {
        self.pass_locks.as_ref().is_some_and(|locks| {
            locks.is_running(&intent.sender) || locks.is_running(&intent.recipient)
        })
    }

    /// One cleanup pass over everything attached.
    pub fn sweep(&self) -> TossResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for mut intent in self.store.list_intents()? {
            if intent.status.is_settleable() && intent.is_expired_at(now) {
                if self.in_reconciliation(&intent) {
                    debug!(intent_id = %intent.id, "expiry deferred, reconciliation running");
                    continue;
                }
                intent.transition(IntentStatus::Expired, Some("expired".into()), now);
                self.store.put_intent(&intent)?;
                report.expired_intents += 1;
            } else if intent.status.is_terminal()
                && intent.expiry.saturating_add(self.retention.as_secs()) <= now
                && self.store.delete_intent(&intent.id)?
            {
                report.deleted_intents += 1;
                if self.store.delete_settlement(&intent.id)? {
                    report.deleted_settlements += 1;
                }
            }
        }

        if let Some(peers) = &self.peers {
            report.peers = peers.purge_expired();
        }
        if let Some(sessions) = &self.sessions {
            report.sessions = sessions.purge_expired();
        }
        if let Some(inbox) = &self.inbox {
            report.reassembly_buffers = inbox.purge_stale();
        }
        if let Some(exchange) = &self.exchange {
            report.requests = exchange.purge_expired();
        }
        if let Some(manager) = &self.nonce_accounts {
            report.nonce_cache = manager.sweep_cache();
        }

        if report.is_empty() {
            debug!("housekeeping sweep: nothing to do");
        } else {
            info!(
                expired = report.expired_intents,
                deleted = report.deleted_intents,
                settlements = report.deleted_settlements,
                peers = report.peers,
                sessions = report.sessions,
                buffers = report.reassembly_buffers,
                requests = report.requests,
                nonce_cache = report.nonce_cache,
                "housekeeping sweep"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` turns true or its sender is
    /// dropped. A failing sweep is logged and retried next tick.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "housekeeping loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep() {
                warn!(error = %e, "housekeeping sweep failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("housekeeping loop stopped");
    }

    /// Run the loop on its own task.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(interval, shutdown).await })
    }
}
