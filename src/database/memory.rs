//! In-memory order store
//!
//! One mutex guards orders and refunds together so every operation is a
//! single atomic unit, mirroring the row locks of the Postgres store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::error::StoreError;
use super::models::{
    refundable_remaining, NewOrder, NewRefund, Order, OrderStatus, OrderUpdate, Refund,
    RefundCreation, RefundSettlement, RefundStatus, RefundUpdate,
};
use super::order_repository::OrderStore;

#[derive(Default)]
struct Inner {
    orders: HashMap<String, Order>,
    refunds: HashMap<String, Refund>,
    next_order_id: i64,
    next_refund_id: i64,
}

impl Inner {
    fn refunds_of(&self, order_ref: &str) -> Vec<Refund> {
        self.refunds
            .values()
            .filter(|r| r.order_ref == order_ref)
            .cloned()
            .collect()
    }
}

#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `created_at`, for window tests.
    pub async fn backdate(&self, order_ref: &str, created_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.orders.get_mut(order_ref) {
            Some(order) => {
                order.created_at = created_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.orders.contains_key(&order.order_ref) {
            return Err(StoreError::Duplicate {
                key: order.order_ref,
            });
        }

        inner.next_order_id += 1;
        let now = Utc::now();
        let record = Order {
            id: inner.next_order_id,
            order_ref: order.order_ref,
            app_id: order.app_id,
            provider: order.provider,
            provider_txn_id: None,
            amount: order.amount,
            currency: order.currency,
            callback_url: order.callback_url,
            status: OrderStatus::Pending,
            settled_amount: None,
            needs_review: false,
            created_at: now,
            updated_at: now,
            settled_at: None,
        };
        inner.orders.insert(record.order_ref.clone(), record.clone());
        Ok(record)
    }

    async fn find_order(&self, order_ref: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.inner.lock().await.orders.get(order_ref).cloned())
    }

    async fn compare_and_set_order(
        &self,
        order_ref: &str,
        expected: OrderStatus,
        update: OrderUpdate,
    ) -> Result<Option<Order>, StoreError> {
        let mut inner = self.inner.lock().await;
        let order = match inner.orders.get_mut(order_ref) {
            Some(order) if order.status == expected => order,
            _ => return Ok(None),
        };

        order.status = update.status;
        if order.settled_amount.is_none() {
            order.settled_amount = update.settled_amount;
        }
        if order.provider_txn_id.is_none() {
            order.provider_txn_id = update.provider_txn_id;
        }
        if order.settled_at.is_none() {
            order.settled_at = update.settled_at;
        }
        order.needs_review |= update.needs_review;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn list_pending_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.lock().await;
        let mut page: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .filter(|o| o.created_at >= from && o.created_at < to)
            .filter(|o| o.id > after_id)
            .cloned()
            .collect();
        page.sort_by_key(|o| o.id);
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }

    async fn find_refund(&self, refund_ref: &str) -> Result<Option<Refund>, StoreError> {
        Ok(self.inner.lock().await.refunds.get(refund_ref).cloned())
    }

    async fn list_refunds(&self, order_ref: &str) -> Result<Vec<Refund>, StoreError> {
        let mut refunds = self.inner.lock().await.refunds_of(order_ref);
        refunds.sort_by_key(|r| r.id);
        Ok(refunds)
    }

    async fn create_refund(&self, refund: NewRefund) -> Result<RefundCreation, StoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.refunds.get(&refund.refund_ref) {
            if existing.order_ref != refund.order_ref {
                return Err(StoreError::Duplicate {
                    key: refund.refund_ref,
                });
            }
            return Ok(RefundCreation::Existing(existing.clone()));
        }
        let order = match inner.orders.get(&refund.order_ref) {
            Some(order) => order.clone(),
            None => return Ok(RefundCreation::OrderNotFound),
        };
        if !order.status.is_refundable() {
            return Ok(RefundCreation::NotRefundable(order.status));
        }
        let remaining = refundable_remaining(&order, &inner.refunds_of(&order.order_ref));
        if refund.amount > remaining {
            return Ok(RefundCreation::ExceedsRefundable { remaining });
        }

        inner.next_refund_id += 1;
        let now = Utc::now();
        let record = Refund {
            id: inner.next_refund_id,
            refund_ref: refund.refund_ref,
            order_ref: refund.order_ref,
            amount: refund.amount,
            reason: refund.reason,
            status: RefundStatus::Requested,
            provider_refund_id: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        };
        inner.refunds.insert(record.refund_ref.clone(), record.clone());

        if let Some(order) = inner.orders.get_mut(&record.order_ref) {
            if order.status.can_transition_to(OrderStatus::Refunding) {
                order.status = OrderStatus::Refunding;
                order.updated_at = now;
            }
        }
        Ok(RefundCreation::Created(record))
    }

    async fn settle_refund(
        &self,
        order_ref: &str,
        refund_ref: &str,
        update: RefundUpdate,
    ) -> Result<RefundSettlement, StoreError> {
        let mut inner = self.inner.lock().await;

        let order = match inner.orders.get(order_ref) {
            Some(order) => order.clone(),
            None => return Ok(RefundSettlement::OrderNotFound),
        };
        let refund = match inner.refunds.get(refund_ref) {
            Some(refund) if refund.order_ref == order_ref => refund.clone(),
            _ => return Ok(RefundSettlement::RefundNotFound),
        };
        if !refund.status.can_transition_to(update.status) {
            return Ok(RefundSettlement::AlreadySettled(refund));
        }
        if !order.status.is_refundable() {
            return Ok(RefundSettlement::OrderNotRefundable(order.status));
        }

        let settled = order.settled_amount.unwrap_or(order.amount);
        let succeeded: i64 = inner
            .refunds_of(order_ref)
            .iter()
            .filter(|r| r.status == RefundStatus::Succeeded)
            .map(|r| r.amount)
            .sum();
        let succeeding = update.status == RefundStatus::Succeeded;
        if succeeding && succeeded + refund.amount > settled {
            return Ok(RefundSettlement::ExceedsSettled {
                settled,
                succeeded,
                requested: refund.amount,
            });
        }

        let now = Utc::now();
        let fully_refunded = succeeding && succeeded + refund.amount == settled;
        let order_status = if fully_refunded && order.status.can_transition_to(OrderStatus::Refunded) {
            OrderStatus::Refunded
        } else {
            order.status
        };

        let refund = match inner.refunds.get_mut(refund_ref) {
            Some(stored) => {
                stored.status = update.status;
                if stored.provider_refund_id.is_none() {
                    stored.provider_refund_id = update.provider_refund_id;
                }
                stored.updated_at = now;
                stored.settled_at = Some(now);
                stored.clone()
            }
            None => return Ok(RefundSettlement::RefundNotFound),
        };
        if let Some(stored) = inner.orders.get_mut(order_ref) {
            if stored.status != order_status {
                stored.status = order_status;
                stored.updated_at = now;
            }
        }

        Ok(RefundSettlement::Applied {
            refund,
            order_status,
        })
    }
}
