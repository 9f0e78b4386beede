//! HTTP surface over the accrual service.
//!
//! | Method | Path                  | Operation                   |
//! |--------|-----------------------|-----------------------------|
//! | POST   | `/api/deposit`        | open a deposit              |
//! | POST   | `/api/withdraw`       | withdraw a deposit          |
//! | GET    | `/api/deposits/{id}`  | deposit status              |
//! | GET    | `/api/user/{address}` | per-owner summary           |
//! | POST   | `/api/sweep`          | run an accrual sweep now    |
//! | GET    | `/health`             | liveness and last sweep     |
//!
//! Amounts cross the wire as decimal strings in whole token units
//! (`"100.5"` USDC), never as JSON numbers. Every error, including a request
//! body that is not the expected JSON, answers `{"error": "..."}`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accrual::calculator::{format_units, parse_units, Amount};
use crate::accrual::error::{invalid_input, AccrualError};
use crate::accrual::ledger::{Deposit, DepositId};
use crate::accrual::rates::RateOrigin;
use crate::accrual::scheduler::{AccrualScheduler, SweepReport};
use crate::accrual::service::{AccrualService, DepositStatus, TokenSummary};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<AccrualService>,
    pub scheduler: Arc<AccrualScheduler>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/deposit", post(deposit))
        .route("/api/withdraw", post(withdraw))
        .route("/api/deposits/{id}", get(deposit_status))
        .route("/api/user/{address}", get(user_summary))
        .route("/api/sweep", post(sweep))
        .route("/health", get(health))
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub struct ApiError(AccrualError);

impl From<AccrualError> for ApiError {
    fn from(value: AccrualError) -> Self {
        Self(value)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AccrualError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AccrualError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AccrualError::NotFound(_) => StatusCode::NOT_FOUND,
            AccrualError::AlreadyWithdrawn(_) | AccrualError::SweepInProgress => {
                StatusCode::CONFLICT
            }
            AccrualError::Contended(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API: request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `Json` body extractor whose rejections use the API error shape.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(invalid_input(rejection.body_text()))),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub owner: String,
    pub token: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRequest {
    pub deposit_id: String,
    /// Address the deposit was opened by.
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositView {
    pub id: DepositId,
    pub owner: String,
    pub token: String,
    pub strategy: String,
    pub principal: String,
    pub annual_rate_bps: u32,
    pub start_time: DateTime<Utc>,
    pub accumulated_yield: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrued_now: Option<String>,
    pub withdrawn: bool,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositCreated {
    pub deposit: DepositView,
    pub rate_origin: RateOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalView {
    pub id: DepositId,
    pub token: String,
    pub principal: String,
    pub yield_earned: String,
    pub platform_fee: String,
    pub payee_yield: String,
    pub total_amount: String,
    pub withdrawn_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSummaryView {
    pub token: String,
    pub total_deposited: String,
    pub realized_yield: String,
    pub pending_yield: String,
    pub roi_bps: u128,
    pub deposit_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummaryView {
    pub owner: String,
    pub tokens: Vec<TokenSummaryView>,
    pub active_deposits: Vec<DepositView>,
}

/// Decimals used to render amounts of `token`. Tokens no longer configured
/// render in base units.
fn decimals_of(service: &AccrualService, token: &str) -> u8 {
    service.token(token).map(|t| t.decimals).unwrap_or(0)
}

impl DepositView {
    fn render(deposit: &Deposit, decimals: u8, accrued_now: Option<Amount>) -> Self {
        Self {
            id: deposit.id,
            owner: deposit.owner.clone(),
            token: deposit.token.clone(),
            strategy: deposit.strategy.clone(),
            principal: format_units(deposit.principal, decimals),
            annual_rate_bps: deposit.annual_rate.get(),
            start_time: deposit.start_time,
            accumulated_yield: format_units(deposit.accumulated_yield, decimals),
            accrued_now: accrued_now.map(|a| format_units(a, decimals)),
            withdrawn: deposit.withdrawn,
            withdrawn_at: deposit.withdrawn_at,
        }
    }

    fn from_status(service: &AccrualService, status: &DepositStatus) -> Self {
        let decimals = decimals_of(service, &status.deposit.token);
        Self::render(&status.deposit, decimals, Some(status.accrued_now))
    }
}

impl TokenSummaryView {
    fn render(summary: &TokenSummary, decimals: u8) -> Self {
        Self {
            token: summary.token.clone(),
            total_deposited: format_units(summary.total_deposited, decimals),
            realized_yield: format_units(summary.realized_yield, decimals),
            pending_yield: format_units(summary.pending_yield, decimals),
            roi_bps: summary.roi_bps,
            deposit_count: summary.deposit_count,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn deposit(
    State(state): State<ApiState>,
    ApiJson(req): ApiJson<DepositRequest>,
) -> ApiResult<DepositCreated> {
    let decimals = state.service.token(&req.token)?.decimals;
    let principal = parse_units(&req.amount, decimals)?;
    let receipt = state.service.deposit(&req.owner, &req.token, principal).await?;

    Ok(Json(DepositCreated {
        deposit: DepositView::render(&receipt.deposit, decimals, None),
        rate_origin: receipt.rate.origin,
    }))
}

pub async fn withdraw(
    State(state): State<ApiState>,
    ApiJson(req): ApiJson<WithdrawRequest>,
) -> ApiResult<WithdrawalView> {
    let id: DepositId = req.deposit_id.parse()?;
    let receipt = state.service.withdraw(id, &req.owner).await?;
    let decimals = decimals_of(&state.service, &receipt.token);

    Ok(Json(WithdrawalView {
        id: receipt.id,
        principal: format_units(receipt.principal, decimals),
        yield_earned: format_units(receipt.yield_earned, decimals),
        platform_fee: format_units(receipt.platform_fee, decimals),
        payee_yield: format_units(receipt.payee_yield, decimals),
        total_amount: format_units(receipt.total_amount, decimals),
        withdrawn_at: receipt.withdrawn_at,
        token: receipt.token,
    }))
}

pub async fn deposit_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<DepositView> {
    let id: DepositId = id.parse()?;
    let status = state.service.status(id)?;
    Ok(Json(DepositView::from_status(&state.service, &status)))
}

pub async fn user_summary(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> ApiResult<UserSummaryView> {
    let summary = state.service.summary(&address)?;

    Ok(Json(UserSummaryView {
        tokens: summary
            .tokens
            .iter()
            .map(|t| TokenSummaryView::render(t, decimals_of(&state.service, &t.token)))
            .collect(),
        active_deposits: summary
            .active_deposits
            .iter()
            .map(|s| DepositView::from_status(&state.service, s))
            .collect(),
        owner: summary.owner,
    }))
}

pub async fn sweep(State(state): State<ApiState>) -> ApiResult<SweepReport> {
    Ok(Json(state.scheduler.run_now().await?))
}

pub async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "last_sweep": state.scheduler.last_report(),
    }))
}
