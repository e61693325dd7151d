//! HTTP API for the seckill daemon.
//!
//! Provides REST endpoints for:
//! - Health check
//! - Seckill purchase (caller identified by the `x-user-id` header)
//! - Seckill voucher registration and lookup
//! - Order lookup
//! - Dead-letter inspection
//! - Prometheus metrics
//!
//! Every JSON endpoint answers with the `{success, errorMsg, data}` envelope.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use seckill_domain::{OrderId, SeckillVoucher, UserId, VoucherId, VoucherOrder};
use seckill_exec::{DeadLetter, ExecError, PurchaseError};
use seckill_store::StoreError;

use crate::error::DaemonError;
use crate::order_pipeline::OrderPipeline;

/// Header carrying the authenticated caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState {
    pub pipeline: Arc<OrderPipeline>,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Response envelope shared by every JSON endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, error_msg: None, data: Some(data), total: None }
    }

    fn ok_list(data: T, total: usize) -> Self {
        Self { success: true, error_msg: None, data: Some(data), total: Some(total) }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self { success: false, error_msg: Some(message.into()), data: None, total: None }
    }
}

type ApiReply<T> = (StatusCode, Json<ApiResponse<T>>);

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Request to register a seckill voucher.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVoucherRequest {
    pub voucher_id: VoucherId,
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// A registered seckill voucher.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherView {
    pub voucher_id: VoucherId,
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<SeckillVoucher> for VoucherView {
    fn from(voucher: SeckillVoucher) -> Self {
        Self {
            voucher_id: voucher.voucher_id,
            stock: voucher.stock,
            begin_time: voucher.begin_time,
            end_time: voucher.end_time,
        }
    }
}

/// A persisted voucher order.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub status: i16,
    pub create_time: DateTime<Utc>,
}

impl From<VoucherOrder> for OrderView {
    fn from(order: VoucherOrder) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            voucher_id: order.voucher_id,
            status: order.status.code(),
            create_time: order.created_at,
        }
    }
}

/// A message on the dead-letter path.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterView {
    pub correlation_id: String,
    pub original_exchange: String,
    pub original_routing_key: String,
    pub routing_key: String,
    pub payload: String,
    pub reason: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl From<&DeadLetter> for DeadLetterView {
    fn from(letter: &DeadLetter) -> Self {
        Self {
            correlation_id: letter.correlation_id.clone(),
            original_exchange: letter.original_exchange.clone(),
            original_routing_key: letter.original_routing_key.clone(),
            routing_key: letter.routing_key.clone(),
            payload: letter.payload_text(),
            reason: letter.reason.clone(),
            delivery_count: letter.delivery_count,
            dead_lettered_at: letter.dead_lettered_at,
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/voucher-order/seckill/:voucher_id", post(seckill_handler))
        .route("/voucher-order/:order_id", get(get_order_handler))
        .route("/voucher/seckill", post(register_voucher_handler))
        .route("/voucher/seckill/:voucher_id", get(get_voucher_handler))
        .route("/queue/dead-letters", get(dead_letters_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Buy one unit of a seckill voucher.
async fn seckill_handler(
    State(state): State<Arc<ApiState>>,
    Path(voucher_id): Path<VoucherId>,
    headers: HeaderMap,
) -> ApiReply<OrderId> {
    let Some(user_id) = caller(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(ApiResponse::fail("Login required")));
    };

    match state.pipeline.purchase(user_id, voucher_id).await {
        Ok(admission) => (StatusCode::OK, Json(ApiResponse::ok(admission.order_id))),
        Err(PurchaseError::OutOfStock) => {
            (StatusCode::OK, Json(ApiResponse::fail("Insufficient stock")))
        },
        Err(PurchaseError::DuplicatePurchase) => {
            (StatusCode::OK, Json(ApiResponse::fail("Each user may only order once")))
        },
        Err(PurchaseError::Unavailable(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::fail("Service temporarily unavailable, please retry")),
        ),
    }
}

/// Register a seckill voucher ahead of the sale.
async fn register_voucher_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RegisterVoucherRequest>,
) -> ApiReply<VoucherId> {
    let voucher = match SeckillVoucher::new(
        request.voucher_id,
        request.stock,
        request.begin_time,
        request.end_time,
    ) {
        Ok(voucher) => voucher,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(ApiResponse::fail(e.to_string()))),
    };

    match state.pipeline.register_voucher(&voucher).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(voucher.voucher_id))),
        Err(e) => to_error_response(e),
    }
}

/// Get a registered seckill voucher.
async fn get_voucher_handler(
    State(state): State<Arc<ApiState>>,
    Path(voucher_id): Path<VoucherId>,
) -> ApiReply<VoucherView> {
    match state.pipeline.find_voucher(voucher_id).await {
        Ok(Some(voucher)) => (StatusCode::OK, Json(ApiResponse::ok(voucher.into()))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::fail(format!("Voucher not found: {}", voucher_id))),
        ),
        Err(e) => to_error_response(e),
    }
}

/// Get a persisted order.
async fn get_order_handler(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<OrderId>,
) -> ApiReply<OrderView> {
    match state.pipeline.find_order(order_id).await {
        Ok(Some(order)) => (StatusCode::OK, Json(ApiResponse::ok(order.into()))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::fail(format!("Order not found: {}", order_id))),
        ),
        Err(e) => to_error_response(e),
    }
}

/// List the dead-letter path.
async fn dead_letters_handler(State(state): State<Arc<ApiState>>) -> ApiReply<Vec<DeadLetterView>> {
    match state.pipeline.dead_letters().await {
        Ok(letters) => {
            let views: Vec<DeadLetterView> = letters.iter().map(DeadLetterView::from).collect();
            let total = views.len();
            (StatusCode::OK, Json(ApiResponse::ok_list(views, total)))
        },
        Err(e) => to_error_response(e),
    }
}

/// Prometheus text exposition.
async fn metrics_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<([(header::HeaderName, &'static str); 1], String), (StatusCode, String)> {
    let body = state.pipeline.metrics().gather().map_err(|e| {
        warn!(error = %e, "Failed to encode metrics");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

// =============================================================================
// Helpers
// =============================================================================

fn caller(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<UserId>()
        .ok()
        .filter(|id| *id != 0)
}

fn to_error_response<T>(error: DaemonError) -> ApiReply<T> {
    let status = match &error {
        DaemonError::Domain(_)
        | DaemonError::Exec(ExecError::Domain(_))
        | DaemonError::Exec(ExecError::Store(StoreError::Domain(_))) => StatusCode::BAD_REQUEST,
        DaemonError::Exec(ExecError::Store(StoreError::Duplicate { .. }))
        | DaemonError::Store(StoreError::Duplicate { .. }) => StatusCode::CONFLICT,
        DaemonError::Exec(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        DaemonError::Store(StoreError::Unavailable(_) | StoreError::Connection(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(ApiResponse::fail(error.to_string())))
}

// =============================================================================
// Tests
// =============================================================================
