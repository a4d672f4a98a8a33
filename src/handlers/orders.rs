//! Order history and refund endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use validator::Validate;

use crate::error::AppError;
use crate::middleware::UserContext;
use crate::models::{Order, PaymentRecord, RefundRequest};
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct OrderHistoryResponse {
    pub orders: Vec<Order>,
    pub payments: Vec<PaymentRecord>,
}

/// Orders and payment records for the authenticated user. The payment list
/// is already deduplicated and sorted newest-first by the repository.
pub async fn list_orders(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<Json<OrderHistoryResponse>, AppError> {
    let orders = state.store.list_orders_by_user(&user.user_id).await?;
    let payments = state.store.list_payments_by_user(&user.user_id).await?;

    Ok(Json(OrderHistoryResponse { orders, payments }))
}

#[derive(Debug, serde::Deserialize, Validate)]
pub struct RefundRequestBody {
    #[validate(length(min = 1, max = 2000))]
    pub reason: String,
    #[validate(length(min = 1, max = 5000))]
    pub issue_description: String,
}

/// File a refund for one of the caller's completed orders.
pub async fn request_refund(
    State(state): State<AppState>,
    user: UserContext,
    Path(order_id): Path<String>,
    Json(payload): Json<RefundRequestBody>,
) -> Result<(StatusCode, Json<RefundRequest>), AppError> {
    payload.validate()?;

    let request = state
        .refunds
        .request(&order_id, &user, &payload.reason, &payload.issue_description)
        .await?;

    Ok((StatusCode::CREATED, Json(request)))
}
