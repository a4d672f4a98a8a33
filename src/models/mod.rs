//! Domain records for the purchase flow.
//!
//! `Order` is the per-line-item fulfillment record; `PaymentRecord` is the
//! gateway-verified payment event (one per successful checkout). They are
//! deliberately distinct: a single payment can fulfill several cart lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single line in the active cart.
///
/// Lines are unique by `id`; two lines never share a `product_id` (adding a
/// product already in the cart merges quantities instead).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CartLine {
    pub id: String,
    pub product_id: String,
    pub name: String,
    /// Unit price in the smallest currency unit (paise for INR).
    pub unit_price_minor: u64,
    pub quantity: u32,
}

/// Fulfillment record for one purchased cart line.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub purchase_date: DateTime<Utc>,
    pub status: OrderStatus,
    /// Gateway payment id. Immutable once set; the natural external key for
    /// correlating this order with the captured payment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Completed,
    Processing,
    Refunded,
}

impl OrderStatus {
    /// Valid transitions: `completed -> processing -> refunded`. A refunded
    /// order is terminal and nothing ever regresses.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Completed, OrderStatus::Processing)
                | (OrderStatus::Processing, OrderStatus::Refunded)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Completed => "completed",
            OrderStatus::Processing => "processing",
            OrderStatus::Refunded => "refunded",
        };
        f.write_str(s)
    }
}

/// The gateway-verified payment event, written once per successful checkout.
///
/// `payment_id` is unique per user; duplicate callback delivery must never
/// produce a second visible record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub payment_id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    /// Charged amount in the smallest currency unit.
    pub amount_minor: u64,
    pub currency: String,
    pub product_type: String,
    pub application_name: String,
    pub payment_time: DateTime<Utc>,
    pub status: PaymentStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
}

/// A refund filing against a completed order; one per order.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RefundRequest {
    #[serde(rename = "_id")]
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub reason: String,
    pub issue_description: String,
    pub request_date: DateTime<Utc>,
    pub status: RefundStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Approved,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transition_table() {
        use OrderStatus::*;

        assert!(Completed.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Refunded));

        assert!(!Completed.can_transition_to(Refunded));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Processing));
        assert!(!Refunded.can_transition_to(Refunded));
    }
}
