//! Durable store for orders, payment records, and refund requests.
//!
//! The repository is the only writer of purchase state; status transitions
//! are validated here so no caller can regress an order. Payment records are
//! deduplicated by `payment_id` at the write boundary (unique index) and
//! again at the read boundary, so duplicate callback delivery never shows
//! the user a double purchase.

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use thiserror::Error;

use crate::error::AppError;
use crate::models::{Order, OrderStatus, PaymentRecord, RefundRequest};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("persistence failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::InvalidTransition { from, to } => AppError::InvalidTransition { from, to },
            StoreError::Backend(source) => AppError::DatabaseError(source),
        }
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save_order(&self, order: &Order) -> Result<(), StoreError>;
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError>;
    async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError>;

    /// Applies a status transition, enforcing
    /// `completed -> processing -> refunded`.
    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<Order, StoreError>;

    /// Returns `false` when a record with the same `payment_id` already
    /// exists; the duplicate write is absorbed, not an error.
    async fn save_payment_record(&self, record: &PaymentRecord) -> Result<bool, StoreError>;
    async fn find_payment_by_id(&self, payment_id: &str)
        -> Result<Option<PaymentRecord>, StoreError>;
    /// Newest first, deduplicated by `payment_id`.
    async fn list_payments_by_user(&self, user_id: &str)
        -> Result<Vec<PaymentRecord>, StoreError>;

    async fn save_refund_request(&self, request: &RefundRequest) -> Result<(), StoreError>;
    async fn find_refund_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<RefundRequest>, StoreError>;
}

fn dedupe_by_payment_id(records: Vec<PaymentRecord>) -> Vec<PaymentRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.payment_id.clone()))
        .collect()
}

fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        _ => false,
    }
}

fn is_missing_index_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        ErrorKind::Command(ce) => ce.message.to_lowercase().contains("index"),
        _ => false,
    }
}

/// MongoDB-backed store.
#[derive(Clone)]
pub struct MongoOrderRepository {
    orders: Collection<Order>,
    payments: Collection<PaymentRecord>,
    refunds: Collection<RefundRequest>,
}

impl MongoOrderRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            orders: db.collection("orders"),
            payments: db.collection("payments"),
            refunds: db.collection("refund_requests"),
        }
    }

    pub async fn init_indexes(&self) -> Result<(), StoreError> {
        let order_user_index = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(IndexOptions::builder().name("order_user_idx".to_string()).build())
            .build();
        self.orders.create_indexes([order_user_index], None).await?;

        let payment_user_index = IndexModel::builder()
            .keys(doc! { "user_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_user_idx".to_string())
                    .build(),
            )
            .build();
        // Write-side dedup: duplicate callback delivery hits this index.
        let payment_id_index = IndexModel::builder()
            .keys(doc! { "payment_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("payment_id_unique_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        self.payments
            .create_indexes([payment_user_index, payment_id_index], None)
            .await?;

        // One refund request per order.
        let refund_order_index = IndexModel::builder()
            .keys(doc! { "order_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("refund_order_unique_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        self.refunds.create_indexes([refund_order_index], None).await?;

        tracing::info!("order store indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MongoOrderRepository {
    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.insert_one(order, None).await?;
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let order = self.orders.find_one(doc! { "_id": order_id }, None).await?;
        Ok(order)
    }

    async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        use futures::TryStreamExt;
        let cursor = self.orders.find(doc! { "user_id": user_id }, None).await?;
        let orders: Vec<Order> = cursor.try_collect().await?;
        Ok(orders)
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<Order, StoreError> {
        let mut order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;

        if !order.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: order.status,
                to: status,
            });
        }

        let to_bson = |s: &OrderStatus| {
            mongodb::bson::to_bson(s).map_err(|e| StoreError::Backend(anyhow::Error::new(e)))
        };
        // The expected current status is part of the match, so a concurrent
        // transition turns this update into a no-op instead of a second
        // apply; per-document atomicity does the rest.
        let filter = doc! { "_id": order_id, "status": to_bson(&order.status)? };
        let update = doc! { "$set": { "status": to_bson(&status)? } };
        let result = self.orders.update_one(filter, update, None).await?;
        if result.modified_count == 0 {
            return Err(StoreError::InvalidTransition {
                from: order.status,
                to: status,
            });
        }
        order.status = status;

        tracing::info!(order_id = %order_id, status = %status, "order status updated");
        Ok(order)
    }

    async fn save_payment_record(&self, record: &PaymentRecord) -> Result<bool, StoreError> {
        match self.payments.insert_one(record, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key_error(&e) => {
                tracing::info!(
                    payment_id = %record.payment_id,
                    "payment record already exists, duplicate write absorbed"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_payment_by_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let record = self
            .payments
            .find_one(doc! { "payment_id": payment_id }, None)
            .await?;
        Ok(record)
    }

    async fn list_payments_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        use futures::TryStreamExt;

        let filter = doc! { "user_id": user_id };
        let sorted = FindOptions::builder()
            .sort(doc! { "payment_time": -1 })
            .build();

        let records: Vec<PaymentRecord> = match self.payments.find(filter.clone(), sorted).await {
            Ok(cursor) => cursor.try_collect().await?,
            // Degraded mode: without the sort index we still answer, just
            // with an unsorted scan plus a client-side sort.
            Err(e) if is_missing_index_error(&e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "sorted payments query failed, falling back to unsorted read"
                );
                let cursor = self.payments.find(filter, None).await?;
                let mut records: Vec<PaymentRecord> = cursor.try_collect().await?;
                records.sort_by(|a, b| b.payment_time.cmp(&a.payment_time));
                records
            }
            Err(e) => return Err(e.into()),
        };

        Ok(dedupe_by_payment_id(records))
    }

    async fn save_refund_request(&self, request: &RefundRequest) -> Result<(), StoreError> {
        self.refunds.insert_one(request, None).await?;
        Ok(())
    }

    async fn find_refund_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<RefundRequest>, StoreError> {
        let request = self
            .refunds
            .find_one(doc! { "order_id": order_id }, None)
            .await?;
        Ok(request)
    }
}

/// In-memory store used by unit tests, with write-failure injection for the
/// post-capture partial-failure scenarios.
#[derive(Default)]
pub struct MemoryOrderStore {
    inner: std::sync::Mutex<MemoryInner>,
    fail_payment_writes: std::sync::atomic::AtomicBool,
    fail_order_writes: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct MemoryInner {
    orders: Vec<Order>,
    payments: Vec<PaymentRecord>,
    refunds: Vec<RefundRequest>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_payment_writes(&self) {
        self.fail_payment_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_order_writes(&self) {
        self.fail_order_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }

    pub fn payment_count(&self) -> usize {
        self.inner.lock().unwrap().payments.len()
    }

    pub fn refund_count(&self) -> usize {
        self.inner.lock().unwrap().refunds.len()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        if self
            .fail_order_writes
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected order write failure"
            )));
        }
        self.inner.lock().unwrap().orders.push(order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.orders.iter().find(|o| o.id == order_id).cloned())
    }

    async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .iter()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<Order, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))?;
        if !order.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: order.status,
                to: status,
            });
        }
        order.status = status;
        Ok(order.clone())
    }

    async fn save_payment_record(&self, record: &PaymentRecord) -> Result<bool, StoreError> {
        if self
            .fail_payment_writes
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected payment write failure"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner
            .payments
            .iter()
            .any(|p| p.payment_id == record.payment_id)
        {
            return Ok(false);
        }
        inner.payments.push(record.clone());
        Ok(true)
    }

    async fn find_payment_by_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payments
            .iter()
            .find(|p| p.payment_id == payment_id)
            .cloned())
    }

    async fn list_payments_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let mut records: Vec<PaymentRecord> = {
            let inner = self.inner.lock().unwrap();
            inner
                .payments
                .iter()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect()
        };
        records.sort_by(|a, b| b.payment_time.cmp(&a.payment_time));
        Ok(dedupe_by_payment_id(records))
    }

    async fn save_refund_request(&self, request: &RefundRequest) -> Result<(), StoreError> {
        self.inner.lock().unwrap().refunds.push(request.clone());
        Ok(())
    }

    async fn find_refund_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<RefundRequest>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .refunds
            .iter()
            .find(|r| r.order_id == order_id)
            .cloned())
    }
}
