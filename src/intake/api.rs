//! Intake HTTP Layer
//!
//! - `POST /transfer`: accept a transfer, 202 with the new transaction id
//! - `GET /transactions/{id}`: current ledger record
//! - `GET /isalive`: liveness, served by every process role

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::value::RawValue;
use std::str::FromStr;
use std::sync::Arc;

use super::{IntakeError, RequestIntake};
use crate::health::HealthState;
use crate::settlement::{AccountId, TransactionId, TransactionRecord};
use crate::store::LedgerStore;

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Body of `POST /transfer`. `amount` may be a JSON number or a decimal string.
#[derive(Debug, Deserialize)]
pub struct TransferApiRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    #[serde(deserialize_with = "exact_amount")]
    pub amount: Decimal,
}

/// Read `amount` from its source text so number literals keep every digit
fn exact_amount<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Box::<RawValue>::deserialize(deserializer)?;
    let text = raw.get().trim();
    let parsed = match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(quoted) => Decimal::from_str(quoted),
        None => Decimal::from_str(text).or_else(|_| Decimal::from_scientific(text)),
    };
    parsed.map_err(|_| D::Error::custom(format!("amount is not a decimal: {}", text)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferAccepted {
    pub transaction_id: String,
    pub status: String,
}

/// Body of `GET /transactions/{id}`
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionView {
    pub transaction_id: String,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Decimal string, exact
    pub amount: Decimal,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<TransactionRecord> for TransactionView {
    fn from(record: TransactionRecord) -> Self {
        Self {
            transaction_id: record.transaction_id.to_string(),
            from_account_id: record.sender_id,
            to_account_id: record.receiver_id,
            amount: record.amount,
            status: record.status.as_str().to_string(),
            error_message: record.status.error_message().map(str::to_string),
            created_at: record.created_at,
        }
    }
}

/// Error envelope: `{code, msg}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl ToString) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            data: None,
        }
    }
}

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = -1001;
    pub const INVALID_AMOUNT: i32 = -1002;
    pub const SAME_ACCOUNT: i32 = -1004;
    pub const INVALID_ACCOUNT: i32 = -1005;
    pub const SERVICE_UNAVAILABLE: i32 = -5001;
    pub const PUBLISH_FAILED: i32 = -5002;
    pub const LEDGER_ERROR: i32 = -5003;
    pub const TRANSACTION_NOT_FOUND: i32 = -6001;
}

fn api_code(err: &IntakeError) -> i32 {
    match err {
        IntakeError::InvalidPayload(_) => error_codes::INVALID_PARAMETER,
        IntakeError::InvalidAmount | IntakeError::AmountTooPrecise(_) => {
            error_codes::INVALID_AMOUNT
        }
        IntakeError::SameAccount => error_codes::SAME_ACCOUNT,
        IntakeError::InvalidAccount(_) => error_codes::INVALID_ACCOUNT,
        IntakeError::TransactionNotFound(_) => error_codes::TRANSACTION_NOT_FOUND,
        IntakeError::LedgerUnavailable => error_codes::SERVICE_UNAVAILABLE,
        IntakeError::PublishFailed(_) => error_codes::PUBLISH_FAILED,
        IntakeError::StoreError(_) => error_codes::LEDGER_ERROR,
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ApiResponse::<()>::error(api_code(&self), &self);
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct IntakeState {
    pub intake: RequestIntake,
    /// Read side for `GET /transactions/{id}`
    pub ledger: Option<Arc<dyn LedgerStore>>,
}

/// Intake routes plus `/isalive`
pub fn router(state: Arc<IntakeState>, health: HealthState) -> Router {
    Router::new()
        .route("/transfer", post(create_transfer))
        .route("/transactions/{id}", get(get_transaction))
        .with_state(state)
        .merge(health_router(health))
}

/// `/isalive` alone, for the consumer roles
pub fn health_router(health: HealthState) -> Router {
    Router::new()
        .route("/isalive", get(is_alive))
        .with_state(health)
}

/// POST /transfer
async fn create_transfer(
    State(state): State<Arc<IntakeState>>,
    payload: Result<Json<TransferApiRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TransferAccepted>), IntakeError> {
    let Json(req) = payload.map_err(|e| IntakeError::InvalidPayload(e.body_text()))?;

    let transaction_id = state
        .intake
        .accept(req.from_account_id, req.to_account_id, req.amount)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TransferAccepted {
            transaction_id: transaction_id.to_string(),
            status: "pending".to_string(),
        }),
    ))
}

/// GET /transactions/{id}
async fn get_transaction(
    State(state): State<Arc<IntakeState>>,
    Path(id): Path<String>,
) -> Result<Json<TransactionView>, IntakeError> {
    let ledger = state.ledger.as_ref().ok_or(IntakeError::LedgerUnavailable)?;
    let record = ledger
        .record(&TransactionId::from(id.as_str()))
        .await
        .map_err(|e| IntakeError::StoreError(e.to_string()))?
        .ok_or(IntakeError::TransactionNotFound(id))?;
    Ok(Json(TransactionView::from(record)))
}

/// GET /isalive
async fn is_alive(State(health): State<HealthState>) -> (StatusCode, Json<ApiResponse<()>>) {
    if health.is_healthy() {
        (StatusCode::OK, Json(ApiResponse::success(())))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(503, "unavailable")),
        )
    }
}
