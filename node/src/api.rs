//! # REST API
//!
//! Builds the axum router for the service. Handlers share application
//! state through axum's `State` extractor and translate module errors to
//! HTTP through their [`ErrorClass`].
//!
//! ## Endpoints
//!
//! | Method | Path                                   | Description                      |
//! |--------|----------------------------------------|----------------------------------|
//! | GET    | `/health`                              | Liveness probe                   |
//! | POST   | `/api/purchase/create`                 | Open a purchase intent           |
//! | POST   | `/api/purchase/confirm`                | Buyer reports its payment        |
//! | GET    | `/api/purchase/status/:reference_id`   | Purchase status (never the code) |
//! | POST   | `/api/validate-otp`                    | Redeem a code                    |
//! | POST   | `/api/report/create`                   | Open a report batch              |
//! | GET    | `/api/claim-proof/:claimant`           | Merkle proof for a claimant      |
//! | POST   | `/api/admin/submit-distribution-root`  | Admin: submit batch root         |
//! | POST   | `/api/admin/attach-report-data`        | Admin: attach report payload     |
//!
//! Wire fields are camelCase.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use solvend_protocol::auth::{AdminAuthGate, AdminHeaders};
use solvend_protocol::config;
use solvend_protocol::crypto::address::Address;
use solvend_protocol::distribution::{BatchReceipt, BatchService, BatchStatus, ReportType};
use solvend_protocol::error::{Classify, ErrorClass};
use solvend_protocol::merkle::ClaimProofService;
use solvend_protocol::purchase::{
    Confirmation, PaymentOutcome, PurchaseService, PurchaseStatus, RedeemError,
};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers. Cheap to
/// clone; every service is a bundle of `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub purchases: PurchaseService,
    pub batches: BatchService,
    pub claims: ClaimProofService,
    pub gate: AdminAuthGate,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/purchase/create", post(create_purchase_handler))
        .route("/api/purchase/confirm", post(confirm_purchase_handler))
        .route(
            "/api/purchase/status/:reference_id",
            get(purchase_status_handler),
        )
        .route("/api/validate-otp", post(validate_otp_handler))
        .route("/api/report/create", post(create_report_handler))
        .route("/api/claim-proof/:claimant", get(claim_proof_handler))
        .route(
            "/api/admin/submit-distribution-root",
            post(submit_root_handler),
        )
        .route("/api/admin/attach-report-data", post(attach_report_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An error on its way to the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "unauthorized".into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    /// Map a module error by its class. Internal details stay in the log.
    fn classified<E: Classify + fmt::Display>(err: E) -> Self {
        let class = err.class();
        let status = status_for(class);
        let message = match class {
            ErrorClass::Internal => {
                tracing::error!(error = %err, "request failed");
                "internal server error".to_string()
            }
            ErrorClass::Upstream { .. } => {
                tracing::warn!(error = %err, "chain call failed");
                err.to_string()
            }
            _ => err.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// HTTP status for an error class.
pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Upstream { retryable: true } => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Upstream { retryable: false } => StatusCode::BAD_GATEWAY,
        ErrorClass::Auth => StatusCode::UNAUTHORIZED,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Message shown for both a wrong code and an expired one.
const INVALID_OR_EXPIRED: &str = "invalid or expired code";

fn redeem_error(err: RedeemError) -> ApiError {
    match err {
        RedeemError::InvalidCode | RedeemError::ExpiredCode => {
            ApiError::bad_request(INVALID_OR_EXPIRED)
        }
        other => ApiError::classified(other),
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{field} is not a valid address")))
}

fn required<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str, ApiError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::bad_request(message)),
    }
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePurchaseRequest {
    pub user_wallet: Option<String>,
    pub amount: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePurchaseResponse {
    pub reference_id: String,
    pub treasury_token_account: String,
    pub amount: u64,
    pub memo: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPurchaseRequest {
    pub reference_id: Option<String>,
    pub transaction_signature: Option<String>,
    /// Paying wallet, when the purchase was opened without one.
    pub user_wallet: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPurchaseResponse {
    pub status: PurchaseStatus,
    pub otp: String,
    pub voucher_address: String,
    pub expires_at: DateTime<Utc>,
    /// Voucher creation transaction. Absent while creation is pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_signature: Option<String>,
    /// Why creation is pending. The code stays valid either way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseStatusResponse {
    pub reference_id: String,
    pub status: PurchaseStatus,
    pub amount: u64,
    pub user_wallet: Option<String>,
    pub transaction_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateOtpRequest {
    pub otp: Option<String>,
    pub reference_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateOtpResponse {
    pub success: bool,
    pub reference_id: String,
    pub tx: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReportRequest {
    pub buyer_wallet: Option<String>,
    pub report_type: Option<String>,
    pub timeframe_days: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReportResponse {
    pub reference_id: String,
    pub report_id: u64,
    pub treasury_token_account: String,
    pub report_type: ReportType,
    pub timeframe_days: u32,
    pub amount: u64,
    pub memo: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimProofResponse {
    pub root: String,
    pub claimant: String,
    pub amount: String,
    pub index: usize,
    pub leaf_count: usize,
    pub proof: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRootRequest {
    root: String,
    report_id: u64,
    buyer_wallet: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachReportRequest {
    report_id: u64,
    buyer_wallet: String,
    ipfs_cid: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminReceiptResponse {
    pub success: bool,
    pub report_id: u64,
    pub status: BatchStatus,
    pub transaction_signature: String,
}

impl From<BatchReceipt> for AdminReceiptResponse {
    fn from(r: BatchReceipt) -> Self {
        Self {
            success: true,
            report_id: r.batch_id,
            status: r.status,
            transaction_signature: r.transaction_signature,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness only.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "version": state.version })),
    )
}

/// `POST /api/purchase/create`
async fn create_purchase_handler(
    State(state): State<AppState>,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<Json<CreatePurchaseResponse>, ApiError> {
    let amount = req
        .amount
        .ok_or_else(|| ApiError::bad_request("amount is required"))?;
    let wallet = match req.user_wallet.as_deref().map(str::trim) {
        Some(w) if !w.is_empty() => Some(parse_address("userWallet", w)?),
        _ => None,
    };

    let intent = state
        .purchases
        .create_purchase(wallet, amount)
        .map_err(ApiError::classified)?;
    state.metrics.purchases_created_total.inc();

    Ok(Json(CreatePurchaseResponse {
        reference_id: intent.reference_id,
        treasury_token_account: intent.payment_target.to_string(),
        amount: intent.amount,
        memo: intent.memo,
    }))
}

/// `POST /api/purchase/confirm` — the buyer's own report of its payment.
/// The winner of the race gets the code in the response; the loser gets 409.
async fn confirm_purchase_handler(
    State(state): State<AppState>,
    Json(req): Json<ConfirmPurchaseRequest>,
) -> Result<Response, ApiError> {
    const MISSING: &str = "referenceId and transactionSignature are required";
    let reference_id = required(&req.reference_id, MISSING)?;
    let signature = required(&req.transaction_signature, MISSING)?;
    let payer = match req.user_wallet.as_deref().map(str::trim) {
        Some(w) if !w.is_empty() => Some(parse_address("userWallet", w)?),
        _ => None,
    };

    let outcome = state
        .purchases
        .payment_observed(reference_id, signature, payer, Confirmation::Direct)
        .await
        .map_err(ApiError::classified)?;

    let (status, body) = match outcome {
        PaymentOutcome::Issued {
            code,
            voucher_address,
            create_tx,
            expires_at,
        } => (
            StatusCode::OK,
            ConfirmPurchaseResponse {
                status: PurchaseStatus::VoucherCreated,
                otp: code,
                voucher_address: voucher_address.to_string(),
                expires_at,
                transaction_signature: Some(create_tx),
                chain_error: None,
            },
        ),
        PaymentOutcome::IssuedPendingChain {
            code,
            voucher_address,
            expires_at,
            error,
        } => {
            state.metrics.voucher_creation_failures_total.inc();
            (
                StatusCode::ACCEPTED,
                ConfirmPurchaseResponse {
                    status: PurchaseStatus::Pending,
                    otp: code,
                    voucher_address: voucher_address.to_string(),
                    expires_at,
                    transaction_signature: None,
                    chain_error: Some(error.to_string()),
                },
            )
        }
        PaymentOutcome::AlreadyHandled { status } => {
            tracing::debug!(reference_id, ?status, "confirm lost the race");
            return Err(ApiError::conflict("payment already processed"));
        }
    };

    state
        .metrics
        .payments_observed_total
        .with_label_values(&[Confirmation::Direct.as_str()])
        .inc();
    state.metrics.vouchers_issued_total.inc();
    Ok((status, Json(body)).into_response())
}

/// `GET /api/purchase/status/:reference_id`
async fn purchase_status_handler(
    State(state): State<AppState>,
    Path(reference_id): Path<String>,
) -> Result<Json<PurchaseStatusResponse>, ApiError> {
    let view = state
        .purchases
        .status(&reference_id)
        .map_err(ApiError::classified)?;
    Ok(Json(PurchaseStatusResponse {
        reference_id: view.reference_id,
        status: view.status,
        amount: view.amount,
        user_wallet: view.user_wallet.map(|w| w.to_string()),
        transaction_signature: view.transaction_signature,
        created_at: view.created_at,
        expires_at: view.expires_at,
    }))
}

/// `POST /api/validate-otp` — redeem a code.
async fn validate_otp_handler(
    State(state): State<AppState>,
    Json(req): Json<ValidateOtpRequest>,
) -> Result<Json<ValidateOtpResponse>, ApiError> {
    let otp = required(&req.otp, "otp is required")?;
    let reference_id = req.reference_id.as_deref().map(str::trim).filter(|r| !r.is_empty());

    match state.purchases.redeem(otp, reference_id).await {
        Ok(redemption) => {
            state.metrics.redemptions_total.inc();
            Ok(Json(ValidateOtpResponse {
                success: true,
                reference_id: redemption.reference_id,
                tx: redemption.redeem_tx,
            }))
        }
        Err(e) => {
            let class = e.class().to_string();
            state
                .metrics
                .redemption_failures_total
                .with_label_values(&[class.as_str()])
                .inc();
            Err(redeem_error(e))
        }
    }
}

/// `POST /api/report/create`
async fn create_report_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateReportRequest>,
) -> Result<Json<CreateReportResponse>, ApiError> {
    const MISSING: &str = "buyerWallet, reportType, and timeframeDays are required";
    let buyer = parse_address("buyerWallet", required(&req.buyer_wallet, MISSING)?)?;
    let report_type: ReportType = required(&req.report_type, MISSING)?
        .parse()
        .map_err(ApiError::bad_request)?;
    let timeframe_days = req
        .timeframe_days
        .ok_or_else(|| ApiError::bad_request(MISSING))?;

    let intent = state
        .batches
        .create_batch(buyer, report_type, timeframe_days)
        .map_err(ApiError::classified)?;

    Ok(Json(CreateReportResponse {
        reference_id: intent.reference_id,
        report_id: intent.batch_id,
        treasury_token_account: intent.payment_target.to_string(),
        report_type: intent.report_type,
        timeframe_days: intent.timeframe_days,
        amount: intent.amount,
        memo: intent.memo,
    }))
}

/// `GET /api/claim-proof/:claimant`
async fn claim_proof_handler(
    State(state): State<AppState>,
    Path(claimant): Path<String>,
) -> Result<Json<ClaimProofResponse>, ApiError> {
    let proof = state
        .claims
        .get_proof(&claimant)
        .map_err(ApiError::classified)?;
    Ok(Json(ClaimProofResponse {
        root: proof.root,
        claimant: proof.claimant,
        amount: proof.amount,
        index: proof.index,
        leaf_count: proof.leaf_count,
        proof: proof.proof,
    }))
}

/// Run the admin gate over the raw body. Rejections are counted by reason
/// but the client only ever sees a bare 401.
fn authorize(state: &AppState, headers: &HeaderMap, body: &Value) -> Result<Address, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let admin_headers = AdminHeaders {
        public_key: header(config::HEADER_PUBLIC_KEY),
        timestamp: header(config::HEADER_TIMESTAMP),
        signature: header(config::HEADER_SIGNATURE),
    };

    state.gate.verify(&admin_headers, body).map_err(|e| {
        state
            .metrics
            .auth_rejections_total
            .with_label_values(&[e.reason()])
            .inc();
        tracing::warn!(reason = e.reason(), "admin request rejected");
        ApiError::unauthorized()
    })
}

/// `POST /api/admin/submit-distribution-root`
async fn submit_root_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<AdminReceiptResponse>, ApiError> {
    authorize(&state, &headers, &body)?;
    let req: SubmitRootRequest = serde_json::from_value(body)
        .map_err(|_| ApiError::bad_request("root, reportId, and buyerWallet are required"))?;
    let buyer = parse_address("buyerWallet", &req.buyer_wallet)?;

    let receipt = state
        .batches
        .submit_root(req.report_id, buyer, &req.root)
        .await
        .map_err(ApiError::classified)?;
    Ok(Json(receipt.into()))
}

/// `POST /api/admin/attach-report-data`
async fn attach_report_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<AdminReceiptResponse>, ApiError> {
    authorize(&state, &headers, &body)?;
    let req: AttachReportRequest = serde_json::from_value(body)
        .map_err(|_| ApiError::bad_request("reportId, buyerWallet, and ipfsCid are required"))?;
    let buyer = parse_address("buyerWallet", &req.buyer_wallet)?;

    let receipt = state
        .batches
        .attach_report_data(req.report_id, buyer, &req.ipfs_cid)
        .await
        .map_err(ApiError::classified)?;
    Ok(Json(receipt.into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
