//! Checkout endpoints.
//!
//! The widget-facing flow is split across HTTP hops: `create-order` opens a
//! checkout and parks the flow keyed by the gateway order id, and
//! `verify-payment` picks it back up with the widget's callback payload. A
//! missing parked flow (new tab, restart) is rebuilt from the persisted cart.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppError;
use crate::middleware::UserContext;
use crate::services::cart::{CartStore, NewCartLine};
use crate::services::checkout::{CheckoutFlow, CheckoutReceipt};
use crate::services::invoice::{build_receipt, DownloadGrant, ProductVariant, ReceiptDocument};
use crate::services::razorpay::PaymentCallback;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Inline cart lines; when omitted the caller's persisted cart is used.
    pub items: Option<Vec<NewCartLine>>,
    /// Product build the user selected (windows/linux).
    pub product_variant: Option<ProductVariant>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub razorpay_order_id: String,
    pub amount_minor: u64,
    pub display_total_minor: u64,
    pub currency: String,
    /// For widget initialization on the client.
    pub razorpay_key_id: String,
}

/// Begin a checkout for the caller's cart.
pub async fn create_order(
    State(state): State<AppState>,
    user: UserContext,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    let variant = payload.product_variant.unwrap_or(ProductVariant::Windows);

    let cart = match payload.items {
        Some(items) => {
            let mut cart = CartStore::new(&user.user_id, state.cart_persistence.clone());
            for item in items {
                cart.add_item(item).await;
            }
            cart
        }
        None => CartStore::load(&user.user_id, state.cart_persistence.clone()).await,
    };

    tracing::info!(
        user_id = %user.user_id,
        lines = cart.lines().len(),
        total_minor = cart.total(),
        "beginning checkout"
    );

    let mut flow = CheckoutFlow::new(
        state.gateway.clone(),
        state.store.clone(),
        user,
        cart,
        &state.config.checkout.currency,
        variant.as_str(),
        state.config.checkout.manual_capture,
    );
    let handoff = flow.begin().await?;

    // Park the flow until the widget calls back.
    state
        .flows
        .insert(handoff.gateway_order_id.clone(), flow);

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            razorpay_order_id: handoff.gateway_order_id,
            amount_minor: handoff.amount_minor,
            display_total_minor: handoff.display_total_minor,
            currency: handoff.currency,
            razorpay_key_id: state.config.razorpay.key_id.clone(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    #[serde(flatten)]
    pub callback: PaymentCallback,
    /// Product build for the rebuilt flow when the parked one is gone;
    /// ignored when the parked flow still holds the original selection.
    pub product_variant: Option<ProductVariant>,
}

/// Widget success callback: verify, capture when configured, fulfill.
pub async fn verify_payment(
    State(state): State<AppState>,
    user: UserContext,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<CheckoutReceipt>, AppError> {
    let order_id = payload.callback.razorpay_order_id.clone();
    let mut flow = match state.flows.remove(&order_id) {
        Some((key, flow)) => {
            if flow.user_id() != user.user_id {
                // Not this caller's checkout; park it again untouched.
                state.flows.insert(key, flow);
                return Err(AppError::NotFound(format!(
                    "no pending checkout for order {}",
                    order_id
                )));
            }
            flow
        }
        None => {
            // The parked flow is gone; rebuild from the persisted cart.
            tracing::info!(
                order_id = %order_id,
                user_id = %user.user_id,
                "no parked checkout flow, resuming from the persisted cart"
            );
            let cart = CartStore::load(&user.user_id, state.cart_persistence.clone()).await;
            if cart.is_empty() {
                return Err(AppError::NotFound(format!(
                    "no pending checkout for order {}",
                    order_id
                )));
            }
            let variant = payload.product_variant.unwrap_or(ProductVariant::Windows);
            CheckoutFlow::resume(
                state.gateway.clone(),
                state.store.clone(),
                user,
                cart,
                &state.config.checkout.currency,
                variant.as_str(),
                state.config.checkout.manual_capture,
                &order_id,
            )
        }
    };

    let receipt = flow.handle_payment(payload.callback).await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CaptureRequest {
    pub payment_id: String,
    #[validate(range(min = 1))]
    pub amount_minor: u64,
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub payment_id: String,
    pub status: String,
}

/// Manual capture passthrough for payments authorized without auto-capture.
pub async fn capture_payment(
    State(state): State<AppState>,
    _user: UserContext,
    Json(payload): Json<CaptureRequest>,
) -> Result<Json<CaptureResponse>, AppError> {
    payload.validate()?;
    let currency = payload
        .currency
        .unwrap_or_else(|| state.config.checkout.currency.clone());

    let result = state
        .gateway
        .capture(&payload.payment_id, payload.amount_minor, &currency)
        .await?;

    Ok(Json(CaptureResponse {
        payment_id: payload.payment_id,
        status: format!("{:?}", result).to_lowercase(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AbandonRequest {
    pub razorpay_order_id: String,
}

/// Widget dismissal. Idempotent; an unknown order id is still a 200 because
/// there is nothing durable to undo.
pub async fn abandon_checkout(
    State(state): State<AppState>,
    user: UserContext,
    Json(payload): Json<AbandonRequest>,
) -> Result<StatusCode, AppError> {
    if let Some((_, mut flow)) = state.flows.remove(&payload.razorpay_order_id) {
        if flow.user_id() == user.user_id {
            flow.abandon();
        } else {
            // Not this user's checkout; put it back untouched.
            state.flows.insert(payload.razorpay_order_id, flow);
        }
    }
    Ok(StatusCode::OK)
}

/// Receipt for a completed payment.
pub async fn get_invoice(
    State(state): State<AppState>,
    user: UserContext,
    Path(payment_id): Path<String>,
) -> Result<Json<ReceiptDocument>, AppError> {
    let payment = state
        .store
        .find_payment_by_id(&payment_id)
        .await?
        .filter(|p| p.user_id == user.user_id)
        .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;

    let orders: Vec<_> = state
        .store
        .list_orders_by_user(&user.user_id)
        .await?
        .into_iter()
        .filter(|o| o.transaction_id.as_deref() == Some(payment_id.as_str()))
        .collect();

    Ok(Json(build_receipt(&payment, &orders)))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub variant: Option<ProductVariant>,
}

/// Time-limited download link for a completed payment.
pub async fn get_download(
    State(state): State<AppState>,
    user: UserContext,
    Path(payment_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadGrant>, AppError> {
    let payment = state
        .store
        .find_payment_by_id(&payment_id)
        .await?
        .filter(|p| p.user_id == user.user_id)
        .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;

    let variant = query.variant.unwrap_or(ProductVariant::Windows);
    let grant = state.downloads.issue(&payment.payment_id, variant).await;
    Ok(Json(grant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CheckoutConfig, Config, DatabaseConfig, DownloadConfig, RazorpayConfig, ServerConfig,
        SmtpConfig,
    };
    use crate::services::notify::MockNotifier;
    use crate::services::razorpay::MockGateway;
    use crate::services::refund::RefundService;
    use crate::services::repository::{MemoryOrderStore, OrderStore};
    use crate::services::{cart::MemoryCartPersistence, invoice::DownloadIssuer};
    use dashmap::DashMap;
    use secrecy::Secret;
    use std::sync::Arc;

    const TEST_SECRET: &str = "test_key_secret";

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseConfig {
                url: Secret::new("mongodb://localhost:27017".to_string()),
                db_name: "storefront_test".to_string(),
            },
            razorpay: RazorpayConfig {
                key_id: "rzp_test_123".to_string(),
                key_secret: Secret::new(TEST_SECRET.to_string()),
                api_base_url: "http://127.0.0.1:1".to_string(),
                timeout_secs: 1,
            },
            smtp: SmtpConfig {
                enabled: false,
                host: "localhost".to_string(),
                port: 587,
                user: String::new(),
                password: Secret::new(String::new()),
                from_email: "noreply@example.com".to_string(),
                from_name: "Store".to_string(),
                operator_email: "ops@example.com".to_string(),
            },
            download: DownloadConfig {
                endpoint: String::new(),
                token_secret: Secret::new(String::new()),
                fallback_url: "https://downloads.example.com/latest".to_string(),
                timeout_secs: 1,
            },
            checkout: CheckoutConfig {
                currency: "INR".to_string(),
                manual_capture: false,
            },
            service_name: "storefront-service".to_string(),
        }
    }

    struct Harness {
        state: AppState,
        gateway: Arc<MockGateway>,
        store: Arc<MemoryOrderStore>,
        cart_persistence: Arc<MemoryCartPersistence>,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(MockGateway::new(TEST_SECRET));
        let store = Arc::new(MemoryOrderStore::new());
        let cart_persistence = Arc::new(MemoryCartPersistence::new());
        let config = test_config();
        let state = AppState {
            config: config.clone(),
            store: store.clone(),
            cart_persistence: cart_persistence.clone(),
            gateway: gateway.clone(),
            refunds: Arc::new(RefundService::new(
                store.clone(),
                Arc::new(MockNotifier::new()),
            )),
            downloads: DownloadIssuer::new(config.download.clone()),
            flows: Arc::new(DashMap::new()),
        };
        Harness {
            state,
            gateway,
            store,
            cart_persistence,
        }
    }

    fn user(id: &str, email: &str) -> UserContext {
        UserContext::new(id.to_string(), email.to_string(), None)
    }

    fn line(product_id: &str, unit_price_minor: u64) -> NewCartLine {
        NewCartLine {
            product_id: product_id.to_string(),
            name: format!("CheckBlock ({})", product_id),
            unit_price_minor,
            quantity: 1,
        }
    }

    #[tokio::test]
    async fn verify_payment_for_another_users_checkout_leaves_it_parked() {
        let h = harness();

        let (status, Json(created)) = create_order(
            State(h.state.clone()),
            user("victim", "victim@example.com"),
            Json(CreateOrderRequest {
                items: Some(vec![line("checkblock-windows", 100)]),
                product_variant: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let order_id = created.razorpay_order_id;

        let err = verify_payment(
            State(h.state.clone()),
            user("attacker", "attacker@example.com"),
            Json(VerifyPaymentRequest {
                callback: PaymentCallback {
                    razorpay_order_id: order_id.clone(),
                    razorpay_payment_id: "pay_evil".to_string(),
                    razorpay_signature: "bogus".to_string(),
                },
                product_variant: None,
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
        // The victim's parked checkout survives the probe untouched and can
        // still complete.
        assert!(h.state.flows.contains_key(&order_id));

        let callback = PaymentCallback {
            razorpay_order_id: order_id.clone(),
            razorpay_payment_id: "pay_123".to_string(),
            razorpay_signature: h.gateway.sign(&order_id, "pay_123"),
        };
        let Json(receipt) = verify_payment(
            State(h.state.clone()),
            user("victim", "victim@example.com"),
            Json(VerifyPaymentRequest {
                callback,
                product_variant: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(receipt.orders_written, 1);
    }

    #[tokio::test]
    async fn resumed_flow_records_the_requested_variant() {
        let h = harness();

        // Mirror a cart for the user, as if checkout began in a process that
        // has since restarted.
        let mut cart = CartStore::new("user-1", h.cart_persistence.clone());
        cart.add_item(line("checkblock-linux", 100)).await;

        let order_id = "order_lost";
        let Json(receipt) = verify_payment(
            State(h.state.clone()),
            user("user-1", "user@example.com"),
            Json(VerifyPaymentRequest {
                callback: PaymentCallback {
                    razorpay_order_id: order_id.to_string(),
                    razorpay_payment_id: "pay_456".to_string(),
                    razorpay_signature: h.gateway.sign(order_id, "pay_456"),
                },
                product_variant: Some(ProductVariant::Linux),
            }),
        )
        .await
        .unwrap();

        assert_eq!(receipt.payment_id, "pay_456");
        let payments = h.store.list_payments_by_user("user-1").await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].product_type, "linux");
    }
}
