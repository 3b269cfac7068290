//! Fragment sender with per-fragment retry.
//!
//! Each fragment gets up to `max_attempts` tries, sleeping
//! `initial_backoff · 2^(n−1)` between them. A fragment that never gets
//! through does not stop the rest: the send carries on, and the report
//! names every index that failed so the caller can resend just those.

use std::sync::Arc;
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::fragment::{fragment, Fragment};
use super::{SendReport, TransportAdapter, TransportError};
use crate::config::RetryPolicy;

/// Progress callback: `(sent, total, message_id)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u16, u16, &str) + Send + Sync);

pub struct FragmentSender {
    adapter: Arc<dyn TransportAdapter>,
    retry: RetryPolicy,
    mtu: usize,
}

impl FragmentSender {
    pub fn new(adapter: Arc<dyn TransportAdapter>, retry: RetryPolicy, mtu: usize) -> Self {
        Self {
            adapter,
            retry,
            mtu,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Frame `envelope`, fragment it and send every fragment to `peer_id`.
    pub async fn send_envelope(
        &self,
        peer_id: &str,
        message_id: &str,
        envelope: &Envelope,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<SendReport, TransportError> {
        self.send(peer_id, message_id, &envelope.encode(), progress)
            .await
    }

    /// Fragment `payload` and send it. Errors with
    /// [`TransportError::Incomplete`] if any fragment ran out of attempts.
    pub async fn send(
        &self,
        peer_id: &str,
        message_id: &str,
        payload: &[u8],
        progress: Option<ProgressFn<'_>>,
    ) -> Result<SendReport, TransportError> {
        let fragments = fragment(message_id, payload, self.mtu)?;
        let total = fragments.len() as u16;

        let mut sent = Vec::with_capacity(fragments.len());
        let mut failed = Vec::new();

        for frag in &fragments {
            if self.send_one(peer_id, frag).await {
                sent.push(frag.index);
                if let Some(cb) = progress {
                    cb(sent.len() as u16, total, message_id);
                }
            } else {
                failed.push(frag.index);
            }
        }

        let report = SendReport {
            message_id: message_id.to_string(),
            total,
            sent_fragments: sent,
            failed_fragments: failed,
        };

        if report.success() {
            debug!(peer_id, message_id, total, "message sent");
            Ok(report)
        } else {
            warn!(
                peer_id,
                message_id,
                failed = ?report.failed_fragments,
                "message partially sent"
            );
            Err(TransportError::Incomplete(report))
        }
    }

    async fn send_one(&self, peer_id: &str, frag: &Fragment) -> bool {
        let wire = frag.encode();
        let attempts = self.retry.attempts();
        for attempt in 1..=attempts {
            match self.adapter.send(peer_id, &wire).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(peer_id, index = frag.index, attempt, error = %e, "fragment send failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff_after(attempt)).await;
                    }
                }
            }
        }
        false
    }
}
