//! # Status API
//!
//! HTTP interface onto a running device. All handlers share
//! [`AppState`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path            | Description                                   |
//! |--------|-----------------|-----------------------------------------------|
//! | GET    | `/health`       | Liveness probe                                |
//! | GET    | `/status`       | Device id, peers, sessions, intent counts     |
//! | GET    | `/intents`      | Stored intents, optionally `?status=pending`  |
//! | POST   | `/intents`      | Sign and store a new intent                   |
//! | GET    | `/intents/:id`  | One intent with its settlement result         |
//! | GET    | `/metrics`      | Prometheus metrics                            |

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use toss_protocol::crypto::PublicKey;
use toss_protocol::intent::{Intent, IntentExtras, IntentStatus};
use toss_protocol::reconcile::SettlementResult;
use toss_protocol::{OfflineDevice, TossError};

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub device: Arc<OfflineDevice>,
    pub metrics: SharedMetrics,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state.metrics.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route(
            "/intents",
            get(list_intents_handler).post(create_intent_handler),
        )
        .route("/intents/:id", get(intent_handler))
        .with_state(state)
        .merge(metrics)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub device_id: String,
    pub version: String,
    pub active_peers: usize,
    pub sessions: usize,
    pub open_requests: usize,
    /// Intent count per status name.
    pub intents: BTreeMap<String, usize>,
    /// Unix time of the last reconciliation pass for this device's key.
    pub last_sync_time: Option<u64>,
}

/// An intent with keys in base58 and the signature in hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentView {
    pub id: String,
    pub version: u8,
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub nonce: u64,
    pub expiry: u64,
    pub created_at: u64,
    pub nonce_account: Option<String>,
    pub confidential: bool,
    pub signature: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub updated_at: u64,
    pub replay_unverified: bool,
}

impl From<&Intent> for IntentView {
    fn from(intent: &Intent) -> Self {
        Self {
            id: intent.id.clone(),
            version: intent.version,
            sender: intent.sender.to_base58(),
            recipient: intent.recipient.to_base58(),
            amount: intent.amount,
            nonce: intent.nonce,
            expiry: intent.expiry,
            created_at: intent.created_at,
            nonce_account: intent.nonce_account_ref.as_ref().map(|pk| pk.to_base58()),
            confidential: intent.encrypted_payload.is_some(),
            signature: intent.signature.to_hex(),
            status: intent.status.to_string(),
            status_reason: intent.status_reason.clone(),
            updated_at: intent.updated_at,
            replay_unverified: intent.replay_unverified,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntentDetail {
    pub intent: IntentView,
    pub settlement: Option<SettlementResult>,
}

#[derive(Debug, Deserialize)]
pub struct IntentQuery {
    pub status: Option<String>,
}

/// Default lifetime of an intent created through the API.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    /// Base58 public key.
    pub recipient: String,
    pub amount: u64,
    /// Seconds from now. Defaults to an hour.
    pub expires_in: Option<u64>,
    /// Base58 durable nonce account.
    pub nonce_account: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// Parse a status name as accepted on the command line and in queries.
pub fn parse_status(s: &str) -> Option<IntentStatus> {
    match s.to_lowercase().as_str() {
        "pending" => Some(IntentStatus::Pending),
        "settled" => Some(IntentStatus::Settled),
        "failed" => Some(IntentStatus::Failed),
        "rejected" => Some(IntentStatus::Rejected),
        "expired" => Some(IntentStatus::Expired),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let device = &state.device;
    let intents = match device.store().list_intents() {
        Ok(intents) => intents,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("storage error: {}", e),
            )
        }
    };
    let mut counts = BTreeMap::new();
    for intent in &intents {
        *counts.entry(intent.status.to_string()).or_insert(0) += 1;
    }

    let last_sync_time = match device.store().get_reconciliation_state(&device.public_key()) {
        Ok(state) => state.map(|s| s.last_sync_time),
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("storage error: {}", e),
            )
        }
    };

    Json(StatusResponse {
        device_id: device.id().to_string(),
        version: state.version.clone(),
        active_peers: device.peers().active_peers().len(),
        sessions: device.sessions().len(),
        open_requests: device.exchange().len(),
        intents: counts,
        last_sync_time,
    })
    .into_response()
}

async fn list_intents_handler(
    State(state): State<AppState>,
    Query(query): Query<IntentQuery>,
) -> Response {
    let filter = match query.status.as_deref() {
        None => None,
        Some(name) => match parse_status(name) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unknown status: {}", name),
                )
            }
        },
    };

    match state.device.store().list_intents() {
        Ok(intents) => {
            let views: Vec<IntentView> = intents
                .iter()
                .filter(|i| filter.map_or(true, |s| i.status == s))
                .map(IntentView::from)
                .collect();
            Json(views).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("storage error: {}", e),
        ),
    }
}

async fn create_intent_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateIntentRequest>,
) -> Response {
    let recipient = match PublicKey::from_base58(&req.recipient) {
        Ok(pk) => pk,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("recipient: {}", e)),
    };
    let nonce_account_ref = match req.nonce_account.as_deref().map(PublicKey::from_base58) {
        None => None,
        Some(Ok(pk)) => Some(pk),
        Some(Err(e)) => {
            return error_response(StatusCode::BAD_REQUEST, format!("nonce_account: {}", e))
        }
    };

    let expiry = state
        .device
        .codec()
        .now()
        .saturating_add(req.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));
    let extras = IntentExtras {
        nonce_account_ref,
        ..Default::default()
    };

    match state
        .device
        .create_intent(recipient, req.amount, expiry, extras)
        .await
    {
        Ok(intent) => {
            state.metrics.intents_created_total.inc();
            (StatusCode::CREATED, Json(IntentView::from(&intent))).into_response()
        }
        Err(e @ TossError::Validation(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn intent_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let store = state.device.store();
    let intent = match store.get_intent(&id) {
        Ok(Some(intent)) => intent,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("intent not found: {}", id))
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("storage error: {}", e),
            )
        }
    };

    match store.get_settlement(&id) {
        Ok(settlement) => Json(IntentDetail {
            intent: IntentView::from(&intent),
            settlement,
        })
        .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("storage error: {}", e),
        ),
    }
}
