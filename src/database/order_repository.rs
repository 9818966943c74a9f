//! Order store port
//!
//! All mutations of `orders.status` are conditional on the expected current
//! status, so two writers racing on the same row cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::models::{
    NewOrder, NewRefund, Order, OrderStatus, OrderUpdate, Refund, RefundCreation,
    RefundSettlement, RefundUpdate,
};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a PENDING order. Fails with `Duplicate` on a reused order reference.
    async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError>;

    async fn find_order(&self, order_ref: &str) -> Result<Option<Order>, StoreError>;

    /// Applies `update` only if the order is still in `expected`.
    /// Returns `None` when the condition did not hold (or the order is missing).
    async fn compare_and_set_order(
        &self,
        order_ref: &str,
        expected: OrderStatus,
        update: OrderUpdate,
    ) -> Result<Option<Order>, StoreError>;

    /// PENDING orders created in `[from, to)` with `id > after_id`, ascending by id.
    async fn list_pending_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError>;

    async fn find_refund(&self, refund_ref: &str) -> Result<Option<Refund>, StoreError>;

    async fn list_refunds(&self, order_ref: &str) -> Result<Vec<Refund>, StoreError>;

    /// Records a REQUESTED refund and moves the order PAID -> REFUNDING in one unit.
    async fn create_refund(&self, refund: NewRefund) -> Result<RefundCreation, StoreError>;

    /// Settles a REQUESTED refund exactly once, enforcing that succeeded refunds
    /// never exceed the settled amount.
    async fn settle_refund(
        &self,
        order_ref: &str,
        refund_ref: &str,
        update: RefundUpdate,
    ) -> Result<RefundSettlement, StoreError>;
}
