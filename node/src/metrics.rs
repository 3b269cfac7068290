//! # Prometheus Metrics
//!
//! Operational metrics for a device node, scraped at `/metrics`. Everything
//! is registered in a dedicated [`prometheus::Registry`] under the `toss`
//! prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use toss_protocol::reconcile::{ReconciliationReport, SettlementStatus};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Intents signed by this device.
    pub intents_created_total: IntCounter,
    /// Intents confirmed by the ledger during reconciliation.
    pub intents_settled_total: IntCounter,
    /// Intents rejected during reconciliation.
    pub intents_rejected_total: IntCounter,
    /// Peers seen within the liveness window.
    pub active_peers: IntGauge,
    /// Completed housekeeping sweeps.
    pub housekeeping_sweeps_total: IntCounter,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("toss".into()), None)?;

        let intents_created_total =
            IntCounter::new("intents_created_total", "Intents signed by this device")?;
        registry.register(Box::new(intents_created_total.clone()))?;

        let intents_settled_total = IntCounter::new(
            "intents_settled_total",
            "Intents confirmed by the ledger during reconciliation",
        )?;
        registry.register(Box::new(intents_settled_total.clone()))?;

        let intents_rejected_total = IntCounter::new(
            "intents_rejected_total",
            "Intents rejected during reconciliation",
        )?;
        registry.register(Box::new(intents_rejected_total.clone()))?;

        let active_peers = IntGauge::new("active_peers", "Peers seen within the liveness window")?;
        registry.register(Box::new(active_peers.clone()))?;

        let housekeeping_sweeps_total =
            IntCounter::new("housekeeping_sweeps_total", "Completed housekeeping sweeps")?;
        registry.register(Box::new(housekeeping_sweeps_total.clone()))?;

        Ok(Self {
            registry,
            intents_created_total,
            intents_settled_total,
            intents_rejected_total,
            active_peers,
            housekeeping_sweeps_total,
        })
    }

    /// Fold one reconciliation pass into the settlement counters.
    pub fn record_reconciliation(&self, report: &ReconciliationReport) {
        self.intents_settled_total
            .inc_by(report.count(SettlementStatus::Success) as u64);
        self.intents_rejected_total
            .inc_by(report.count(SettlementStatus::Rejected) as u64);
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics` in Prometheus text format. HTTP 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toss_protocol::crypto::DeviceKeypair;
    use toss_protocol::ledger::LedgerRef;
    use toss_protocol::reconcile::{RejectionReason, SettlementResult};

    #[test]
    fn encode_contains_prefixed_names() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.intents_created_total.inc();
        metrics.active_peers.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("toss_intents_created_total 1"));
        assert!(text.contains("toss_active_peers 3"));
    }

    #[test]
    fn reconciliation_counts_settled_and_rejected() {
        let metrics = NodeMetrics::new().unwrap();
        let report = ReconciliationReport {
            signer: DeviceKeypair::generate().public_key(),
            checkpoint: 7,
            results: vec![
                SettlementResult::success("a", LedgerRef("sig-a".into()), 1),
                SettlementResult::success("b", LedgerRef("sig-b".into()), 1),
                SettlementResult::rejected(
                    "c",
                    RejectionReason::InsufficientBalance {
                        required: 10,
                        available: 5,
                    },
                    1,
                ),
                SettlementResult::failed("d", "rpc down".into(), None, 1),
            ],
            conflicts: Vec::new(),
        };

        metrics.record_reconciliation(&report);
        assert_eq!(metrics.intents_settled_total.get(), 2);
        assert_eq!(metrics.intents_rejected_total.get(), 1);
    }
}
