//! Refund filing.
//!
//! A refund request is considered filed once the order transition and the
//! request document are persisted; the operator email is best-effort on top
//! of that, so a flaky mail provider can never make the service claim a
//! filed refund was lost.

use std::sync::Arc;

use crate::error::AppError;
use crate::middleware::UserContext;
use crate::models::{OrderStatus, RefundRequest, RefundStatus};
use crate::services::metrics;
use crate::services::notify::{RefundNotice, RefundNotifier};
use crate::services::repository::OrderStore;

pub struct RefundService {
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn RefundNotifier>,
}

impl RefundService {
    pub fn new(store: Arc<dyn OrderStore>, notifier: Arc<dyn RefundNotifier>) -> Self {
        Self { store, notifier }
    }

    /// File a refund for a completed order. The order moves to `processing`,
    /// the request is persisted, and the operator channel is notified.
    /// Resubmission against an order already in `processing` is rejected, so
    /// at most one request ever exists per order.
    pub async fn request(
        &self,
        order_id: &str,
        user: &UserContext,
        reason: &str,
        issue_description: &str,
    ) -> Result<RefundRequest, AppError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {}", order_id)))?;

        if order.user_id != user.user_id {
            // Don't leak other users' order ids.
            return Err(AppError::NotFound(format!("order {}", order_id)));
        }

        // The transition gate doubles as the duplicate-submission gate: an
        // order already in processing cannot move to processing again.
        let updated = self
            .store
            .update_order_status(order_id, OrderStatus::Processing)
            .await
            .map_err(|err| {
                metrics::record_refund_request("rejected");
                AppError::from(err)
            })?;

        let request = RefundRequest {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            user_id: user.user_id.clone(),
            reason: reason.to_string(),
            issue_description: issue_description.to_string(),
            request_date: chrono::Utc::now(),
            status: RefundStatus::Pending,
        };
        self.store.save_refund_request(&request).await?;

        tracing::info!(
            order_id = %order_id,
            user_id = %user.user_id,
            status = %updated.status,
            "refund request filed"
        );
        metrics::record_refund_request("filed");

        // Best-effort from here on: the filing already succeeded.
        let notice = RefundNotice::from_request(&request, &user.email, user.display_name());
        if let Err(err) = self.notifier.send_refund_notice(&notice).await {
            tracing::error!(
                order_id = %order_id,
                error = %err,
                "refund notice failed to send; request remains filed"
            );
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Order;
    use crate::services::notify::MockNotifier;
    use crate::services::repository::MemoryOrderStore;
    use chrono::Utc;

    fn test_user() -> UserContext {
        UserContext::new(
            "user-1".to_string(),
            "user@example.com".to_string(),
            Some("Test User".to_string()),
        )
    }

    fn completed_order(order_id: &str, user_id: &str) -> Order {
        Order {
            id: order_id.to_string(),
            user_id: user_id.to_string(),
            product_id: "checkblock-windows".to_string(),
            product_name: "CheckBlock for Windows".to_string(),
            quantity: 1,
            purchase_date: Utc::now(),
            status: OrderStatus::Completed,
            transaction_id: Some("pay_123".to_string()),
        }
    }

    fn service(
        store: Arc<MemoryOrderStore>,
        notifier: Arc<MockNotifier>,
    ) -> RefundService {
        RefundService::new(store, notifier)
    }

    #[tokio::test]
    async fn filing_transitions_the_order_and_notifies() {
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(MockNotifier::new());
        store
            .save_order(&completed_order("ord-1", "user-1"))
            .await
            .unwrap();

        let svc = service(store.clone(), notifier.clone());
        let request = svc
            .request("ord-1", &test_user(), "compatibility", "does not start")
            .await
            .unwrap();

        assert_eq!(request.status, RefundStatus::Pending);
        let order = store.get_order("ord-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(notifier.sent_count(), 1);
        assert_eq!(store.refund_count(), 1);
    }

    #[tokio::test]
    async fn second_request_for_the_same_order_is_rejected() {
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(MockNotifier::new());
        store
            .save_order(&completed_order("ord-1", "user-1"))
            .await
            .unwrap();

        let svc = service(store.clone(), notifier.clone());
        svc.request("ord-1", &test_user(), "reason", "details")
            .await
            .unwrap();
        let err = svc
            .request("ord-1", &test_user(), "reason again", "details again")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidTransition { .. }));
        // Exactly one request and one transition happened.
        assert_eq!(store.refund_count(), 1);
        assert_eq!(notifier.sent_count(), 1);
        let order = store.get_order("ord-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn notification_failure_does_not_unfile_the_request() {
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(MockNotifier::new());
        notifier.fail_sends();
        store
            .save_order(&completed_order("ord-1", "user-1"))
            .await
            .unwrap();

        let svc = service(store.clone(), notifier);
        let request = svc
            .request("ord-1", &test_user(), "reason", "details")
            .await
            .unwrap();

        assert_eq!(request.status, RefundStatus::Pending);
        let order = store.get_order("ord-1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(store.refund_count(), 1);
    }

    #[tokio::test]
    async fn refunds_against_other_users_orders_are_hidden() {
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(MockNotifier::new());
        store
            .save_order(&completed_order("ord-1", "someone-else"))
            .await
            .unwrap();

        let svc = service(store, notifier);
        let err = svc
            .request("ord-1", &test_user(), "reason", "details")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(MockNotifier::new());
        let svc = service(store, notifier);
        let err = svc
            .request("missing", &test_user(), "reason", "details")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
