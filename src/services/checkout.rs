//! Checkout orchestration.
//!
//! One `CheckoutFlow` drives a single purchase from cart to durable record:
//!
//! ```text
//! Idle -> OrderCreated -> AwaitingUserAction -> PaymentReported
//!      -> Verified -> Fulfilling -> Completed
//! ```
//!
//! `Failed(reason)` is terminal and reachable from any non-terminal state;
//! `Abandoned` is reachable from `AwaitingUserAction` (user dismissed the
//! widget) or `PaymentReported` (explicit gateway failure callback). Steps
//! execute strictly in sequence within one flow; across flows the repository
//! dedup by `payment_id` is the safety net, not mutual exclusion.
//!
//! Money rule: `capture` is invoked at most once per flow, and everything
//! after capture is best-effort durable: a failed write surfaces an error
//! that carries the `payment_id` instead of silently dropping a paid
//! transaction.

use std::sync::Arc;

use crate::error::AppError;
use crate::middleware::UserContext;
use crate::models::{Order, OrderStatus, PaymentRecord, PaymentStatus};
use crate::services::cart::CartStore;
use crate::services::metrics;
use crate::services::razorpay::{CaptureResult, GatewayError, PaymentCallback, PaymentGateway};
use crate::services::repository::OrderStore;

/// The gateway refuses zero-amount orders, so nominally free products are
/// charged this minimum while the displayed price stays zero.
pub const MIN_CHARGE_MINOR_UNITS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    GatewayUnavailable,
    InvalidAmount,
    SignatureMismatch,
    /// Money was captured but the local record may be incomplete. The
    /// payment id is the reconciliation reference.
    Persistence { payment_id: String },
}

#[derive(Debug)]
pub enum CheckoutState {
    Idle,
    OrderCreated { gateway_order_id: String },
    AwaitingUserAction { gateway_order_id: String },
    PaymentReported { payment_id: String },
    Verified { payment_id: String },
    Fulfilling { payment_id: String },
    Completed { payment_id: String },
    Abandoned,
    Failed(FailureReason),
}

impl CheckoutState {
    pub fn name(&self) -> &'static str {
        match self {
            CheckoutState::Idle => "idle",
            CheckoutState::OrderCreated { .. } => "order_created",
            CheckoutState::AwaitingUserAction { .. } => "awaiting_user_action",
            CheckoutState::PaymentReported { .. } => "payment_reported",
            CheckoutState::Verified { .. } => "verified",
            CheckoutState::Fulfilling { .. } => "fulfilling",
            CheckoutState::Completed { .. } => "completed",
            CheckoutState::Abandoned => "abandoned",
            CheckoutState::Failed(_) => "failed",
        }
    }
}

/// Parameters the external payment widget needs to open.
#[derive(Debug, serde::Serialize)]
pub struct CheckoutHandoff {
    pub gateway_order_id: String,
    /// Amount the gateway will charge, in minor units.
    pub amount_minor: u64,
    /// What the user sees; differs from `amount_minor` only for free
    /// products charged the gateway minimum.
    pub display_total_minor: u64,
    pub currency: String,
}

/// Outcome of a completed flow.
#[derive(Debug, serde::Serialize)]
pub struct CheckoutReceipt {
    pub payment_id: String,
    pub orders_written: usize,
    /// Lines whose order write failed; fulfillment is per-line best-effort
    /// and never rolls back earlier lines.
    pub lines_failed: usize,
}

pub struct CheckoutFlow {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn OrderStore>,
    user: UserContext,
    cart: CartStore,
    currency: String,
    product_variant: String,
    manual_capture: bool,
    amount_minor: u64,
    state: CheckoutState,
}

impl CheckoutFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn OrderStore>,
        user: UserContext,
        cart: CartStore,
        currency: &str,
        product_variant: &str,
        manual_capture: bool,
    ) -> Self {
        Self {
            gateway,
            store,
            user,
            cart,
            currency: currency.to_string(),
            product_variant: product_variant.to_string(),
            manual_capture,
            amount_minor: 0,
            state: CheckoutState::Idle,
        }
    }

    /// Rebuild a flow at `AwaitingUserAction` when the in-process flow for a
    /// gateway order is gone (new tab, process restart). The amount is
    /// recomputed from the cart with the same substitution rule.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn OrderStore>,
        user: UserContext,
        cart: CartStore,
        currency: &str,
        product_variant: &str,
        manual_capture: bool,
        gateway_order_id: &str,
    ) -> Self {
        let mut flow = Self::new(
            gateway,
            store,
            user,
            cart,
            currency,
            product_variant,
            manual_capture,
        );
        flow.amount_minor = Self::chargeable(flow.cart.total());
        flow.state = CheckoutState::AwaitingUserAction {
            gateway_order_id: gateway_order_id.to_string(),
        };
        flow
    }

    fn chargeable(display_total: u64) -> u64 {
        if display_total == 0 {
            MIN_CHARGE_MINOR_UNITS
        } else {
            display_total
        }
    }

    pub fn state(&self) -> &CheckoutState {
        &self.state
    }

    pub fn cart(&self) -> &CartStore {
        &self.cart
    }

    pub fn user_id(&self) -> &str {
        &self.user.user_id
    }

    pub fn gateway_order_id(&self) -> Option<&str> {
        match &self.state {
            CheckoutState::OrderCreated { gateway_order_id }
            | CheckoutState::AwaitingUserAction { gateway_order_id } => Some(gateway_order_id),
            _ => None,
        }
    }

    fn transition(&mut self, next: CheckoutState) {
        tracing::debug!(
            user_id = %self.user.user_id,
            from = self.state.name(),
            to = next.name(),
            "checkout transition"
        );
        self.state = next;
    }

    /// Begin checkout: create the gateway order and hand the widget its
    /// parameters. Only legal from `Idle` with a non-empty cart.
    pub async fn begin(&mut self) -> Result<CheckoutHandoff, AppError> {
        if !matches!(self.state, CheckoutState::Idle) {
            return Err(AppError::BadRequest(format!(
                "checkout already in state {}",
                self.state.name()
            )));
        }
        if self.cart.is_empty() {
            return Err(AppError::BadRequest("cart is empty".to_string()));
        }

        let display_total = self.cart.total();
        let amount = Self::chargeable(display_total);
        let receipt_ref = format!("rcpt_{}", uuid::Uuid::new_v4().simple());
        let notes = serde_json::json!({
            "user_id": self.user.user_id,
            "is_free_product": display_total == 0,
        });

        let order = match self
            .gateway
            .create_order(amount, &self.currency, &receipt_ref, Some(notes))
            .await
        {
            Ok(order) => order,
            Err(err) => {
                let reason = match err {
                    GatewayError::InvalidAmount(_) => FailureReason::InvalidAmount,
                    _ => FailureReason::GatewayUnavailable,
                };
                metrics::record_checkout("gateway_failure");
                self.transition(CheckoutState::Failed(reason));
                return Err(AppError::from(err));
            }
        };

        self.amount_minor = amount;
        self.transition(CheckoutState::OrderCreated {
            gateway_order_id: order.id.clone(),
        });
        // Hand off to the external widget and wait for its callback. The
        // wait is unbounded; a user who walks away simply never resumes.
        self.transition(CheckoutState::AwaitingUserAction {
            gateway_order_id: order.id.clone(),
        });

        Ok(CheckoutHandoff {
            gateway_order_id: order.id,
            amount_minor: amount,
            display_total_minor: display_total,
            currency: self.currency.clone(),
        })
    }

    /// User dismissed the widget, or the gateway reported an explicit
    /// failure. Free to cancel here: nothing durable has happened yet.
    pub fn abandon(&mut self) {
        match self.state {
            CheckoutState::AwaitingUserAction { .. } | CheckoutState::PaymentReported { .. } => {
                metrics::record_checkout("abandoned");
                self.transition(CheckoutState::Abandoned);
            }
            _ => {
                tracing::warn!(
                    state = self.state.name(),
                    "ignoring abandon outside a cancellable state"
                );
            }
        }
    }

    /// Drive the flow from the widget's success callback to completion:
    /// verify the signature, capture (when configured for manual capture),
    /// and persist the purchase records.
    pub async fn handle_payment(
        &mut self,
        callback: PaymentCallback,
    ) -> Result<CheckoutReceipt, AppError> {
        let gateway_order_id = match &self.state {
            CheckoutState::AwaitingUserAction { gateway_order_id } => gateway_order_id.clone(),
            _ => {
                return Err(AppError::BadRequest(format!(
                    "no payment expected in state {}",
                    self.state.name()
                )))
            }
        };
        if callback.razorpay_order_id != gateway_order_id {
            return Err(AppError::BadRequest(
                "order id does not match this checkout".to_string(),
            ));
        }

        let payment_id = callback.razorpay_payment_id.clone();
        self.transition(CheckoutState::PaymentReported {
            payment_id: payment_id.clone(),
        });

        // Fatal gate: a mismatch is potential tampering, never retried with
        // the same payload.
        if !self.gateway.verify_signature(
            &callback.razorpay_order_id,
            &callback.razorpay_payment_id,
            &callback.razorpay_signature,
        ) {
            tracing::warn!(
                user_id = %self.user.user_id,
                order_id = %callback.razorpay_order_id,
                payment_id = %payment_id,
                "payment signature mismatch, possible tampering"
            );
            metrics::record_checkout("signature_mismatch");
            self.transition(CheckoutState::Failed(FailureReason::SignatureMismatch));
            return Err(AppError::SignatureMismatch);
        }

        self.transition(CheckoutState::Verified {
            payment_id: payment_id.clone(),
        });

        if self.manual_capture {
            match self
                .gateway
                .capture(&payment_id, self.amount_minor, &self.currency)
                .await
            {
                Ok(CaptureResult::Captured) => {}
                Ok(CaptureResult::AlreadyCaptured) => {
                    tracing::info!(payment_id = %payment_id, "capture was already settled");
                }
                Err(err) => {
                    let reason = match err {
                        GatewayError::InvalidAmount(_) => FailureReason::InvalidAmount,
                        _ => FailureReason::GatewayUnavailable,
                    };
                    metrics::record_checkout("capture_failure");
                    self.transition(CheckoutState::Failed(reason));
                    return Err(AppError::from(err));
                }
            }
        }

        self.transition(CheckoutState::Fulfilling {
            payment_id: payment_id.clone(),
        });
        self.fulfill(payment_id).await
    }

    /// Turn the verified payment into durable records. The `PaymentRecord`
    /// write comes first; its failure is the critical post-capture case and
    /// aborts with the payment id preserved. Order lines are then written
    /// independently, best-effort.
    async fn fulfill(&mut self, payment_id: String) -> Result<CheckoutReceipt, AppError> {
        let now = chrono::Utc::now();
        let first_line_name = self
            .cart
            .lines()
            .first()
            .map(|l| l.name.clone())
            .unwrap_or_else(|| "CheckBlock".to_string());

        let record = PaymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            payment_id: payment_id.clone(),
            user_id: self.user.user_id.clone(),
            user_email: self.user.email.clone(),
            user_name: self.user.display_name().to_string(),
            amount_minor: self.amount_minor,
            currency: self.currency.clone(),
            product_type: self.product_variant.clone(),
            application_name: first_line_name,
            payment_time: now,
            status: PaymentStatus::Completed,
        };

        match self.store.save_payment_record(&record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    payment_id = %payment_id,
                    "payment already recorded, fulfillment is idempotent"
                );
            }
            Err(err) => {
                tracing::error!(
                    payment_id = %payment_id,
                    user_id = %self.user.user_id,
                    error = %err,
                    "payment captured but the payment record write failed"
                );
                metrics::record_checkout("persistence_error");
                self.transition(CheckoutState::Failed(FailureReason::Persistence {
                    payment_id: payment_id.clone(),
                }));
                return Err(AppError::PersistenceError {
                    payment_id: Some(payment_id),
                    source: anyhow::Error::new(err),
                });
            }
        }

        let mut orders_written = 0;
        let mut lines_failed = 0;
        for line in self.cart.lines() {
            let order = Order {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: self.user.user_id.clone(),
                product_id: line.product_id.clone(),
                product_name: line.name.clone(),
                quantity: line.quantity,
                purchase_date: now,
                status: OrderStatus::Completed,
                transaction_id: Some(payment_id.clone()),
            };
            match self.store.save_order(&order).await {
                Ok(()) => orders_written += 1,
                Err(err) => {
                    // No rollback of earlier lines: partial success plus a
                    // visible error beats losing record of a paid purchase.
                    lines_failed += 1;
                    tracing::error!(
                        payment_id = %payment_id,
                        product_id = %line.product_id,
                        error = %err,
                        "order write failed for a paid line"
                    );
                }
            }
        }

        self.transition(CheckoutState::Completed {
            payment_id: payment_id.clone(),
        });
        self.cart.clear().await;
        metrics::record_checkout("completed");

        tracing::info!(
            payment_id = %payment_id,
            user_id = %self.user.user_id,
            orders_written,
            lines_failed,
            "checkout completed"
        );

        Ok(CheckoutReceipt {
            payment_id,
            orders_written,
            lines_failed,
        })
    }
}
