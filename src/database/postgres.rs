//! Postgres order store
//!
//! Status changes use optimistic `WHERE status = $expected` updates; refund
//! accounting runs in a transaction holding `FOR UPDATE` on the order row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use super::error::StoreError;
use super::models::{
    refundable_remaining, NewOrder, NewRefund, Order, OrderRow, OrderStatus, OrderUpdate, Refund,
    RefundCreation, RefundRow, RefundSettlement, RefundStatus, RefundUpdate,
};
use super::order_repository::OrderStore;
use crate::middleware::logging::log_database_query;

const ORDER_COLUMNS: &str = "id, order_ref, app_id, provider, provider_txn_id, amount, currency, \
     callback_url, status, settled_amount, needs_review, created_at, updated_at, settled_at";
const REFUND_COLUMNS: &str = "id, refund_ref, order_ref, amount, reason, status, \
     provider_refund_id, created_at, updated_at, settled_at";

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

/// Applies the bundled `migrations/`
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_order(
        tx: &mut Transaction<'_, Postgres>,
        order_ref: &str,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE order_ref = $1 FOR UPDATE",
            ORDER_COLUMNS
        ))
        .bind(order_ref)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn refunds_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        order_ref: &str,
    ) -> Result<Vec<Refund>, StoreError> {
        let rows = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {} FROM refunds WHERE order_ref = $1 ORDER BY id",
            REFUND_COLUMNS
        ))
        .bind(order_ref)
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(Refund::try_from).collect()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let query = format!(
            r#"
            INSERT INTO orders (order_ref, app_id, provider, amount, currency, callback_url, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING')
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let result = log_database_query("insert_order", async {
            sqlx::query_as::<_, OrderRow>(&query)
                .bind(&order.order_ref)
                .bind(&order.app_id)
                .bind(order.provider.as_str())
                .bind(order.amount)
                .bind(&order.currency)
                .bind(&order.callback_url)
                .fetch_one(&self.pool)
                .await
        })
        .await;

        match result {
            Ok(row) => Order::try_from(row),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate {
                key: order.order_ref,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_order(&self, order_ref: &str) -> Result<Option<Order>, StoreError> {
        let query = format!("SELECT {} FROM orders WHERE order_ref = $1", ORDER_COLUMNS);
        let row = log_database_query("find_order", async {
            sqlx::query_as::<_, OrderRow>(&query)
                .bind(order_ref)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn compare_and_set_order(
        &self,
        order_ref: &str,
        expected: OrderStatus,
        update: OrderUpdate,
    ) -> Result<Option<Order>, StoreError> {
        let query = format!(
            r#"
            UPDATE orders
            SET status = $3,
                settled_amount = COALESCE(settled_amount, $4),
                provider_txn_id = COALESCE(provider_txn_id, $5),
                needs_review = needs_review OR $6,
                settled_at = COALESCE(settled_at, $7),
                updated_at = NOW()
            WHERE order_ref = $1 AND status = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );
        let row = log_database_query("compare_and_set_order", async {
            sqlx::query_as::<_, OrderRow>(&query)
                .bind(order_ref)
                .bind(expected.as_str())
                .bind(update.status.as_str())
                .bind(update.settled_amount)
                .bind(&update.provider_txn_id)
                .bind(update.needs_review)
                .bind(update.settled_at)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn list_pending_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let query = format!(
            r#"
            SELECT {} FROM orders
            WHERE status = 'PENDING'
            AND created_at >= $1 AND created_at < $2
            AND id > $3
            ORDER BY id ASC
            LIMIT $4
            "#,
            ORDER_COLUMNS
        );
        let rows = log_database_query("list_pending_page", async {
            sqlx::query_as::<_, OrderRow>(&query)
                .bind(from)
                .bind(to)
                .bind(after_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        })
        .await?;
        rows.into_iter().map(Order::try_from).collect()
    }

    async fn find_refund(&self, refund_ref: &str) -> Result<Option<Refund>, StoreError> {
        let query = format!("SELECT {} FROM refunds WHERE refund_ref = $1", REFUND_COLUMNS);
        let row = log_database_query("find_refund", async {
            sqlx::query_as::<_, RefundRow>(&query)
                .bind(refund_ref)
                .fetch_optional(&self.pool)
                .await
        })
        .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn list_refunds(&self, order_ref: &str) -> Result<Vec<Refund>, StoreError> {
        let query = format!(
            "SELECT {} FROM refunds WHERE order_ref = $1 ORDER BY id",
            REFUND_COLUMNS
        );
        let rows = log_database_query("list_refunds", async {
            sqlx::query_as::<_, RefundRow>(&query)
                .bind(order_ref)
                .fetch_all(&self.pool)
                .await
        })
        .await?;
        rows.into_iter().map(Refund::try_from).collect()
    }

    async fn create_refund(&self, refund: NewRefund) -> Result<RefundCreation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let order = match Self::lock_order(&mut tx, &refund.order_ref).await? {
            Some(order) => order,
            None => return Ok(RefundCreation::OrderNotFound),
        };

        let existing = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {} FROM refunds WHERE refund_ref = $1",
            REFUND_COLUMNS
        ))
        .bind(&refund.refund_ref)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            let existing = Refund::try_from(row)?;
            if existing.order_ref != refund.order_ref {
                return Err(StoreError::Duplicate {
                    key: refund.refund_ref,
                });
            }
            return Ok(RefundCreation::Existing(existing));
        }

        if !order.status.is_refundable() {
            return Ok(RefundCreation::NotRefundable(order.status));
        }
        let refunds = Self::refunds_in_tx(&mut tx, &order.order_ref).await?;
        let remaining = refundable_remaining(&order, &refunds);
        if refund.amount > remaining {
            return Ok(RefundCreation::ExceedsRefundable { remaining });
        }

        let row = sqlx::query_as::<_, RefundRow>(&format!(
            r#"
            INSERT INTO refunds (refund_ref, order_ref, amount, reason, status)
            VALUES ($1, $2, $3, $4, 'REQUESTED')
            RETURNING {}
            "#,
            REFUND_COLUMNS
        ))
        .bind(&refund.refund_ref)
        .bind(&refund.order_ref)
        .bind(refund.amount)
        .bind(&refund.reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            // Same reference inserted concurrently against another order
            if is_unique_violation(&e) {
                StoreError::Duplicate {
                    key: refund.refund_ref.clone(),
                }
            } else {
                e.into()
            }
        })?;

        sqlx::query(
            r#"
            UPDATE orders
            SET status = 'REFUNDING', updated_at = NOW()
            WHERE order_ref = $1 AND status = 'PAID'
            "#,
        )
        .bind(&refund.order_ref)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RefundCreation::Created(Refund::try_from(row)?))
    }

    async fn settle_refund(
        &self,
        order_ref: &str,
        refund_ref: &str,
        update: RefundUpdate,
    ) -> Result<RefundSettlement, StoreError> {
        let mut tx = self.pool.begin().await?;

        let order = match Self::lock_order(&mut tx, order_ref).await? {
            Some(order) => order,
            None => return Ok(RefundSettlement::OrderNotFound),
        };
        let refunds = Self::refunds_in_tx(&mut tx, order_ref).await?;
        let refund = match refunds.iter().find(|r| r.refund_ref == refund_ref) {
            Some(refund) => refund.clone(),
            None => return Ok(RefundSettlement::RefundNotFound),
        };
        if !refund.status.can_transition_to(update.status) {
            return Ok(RefundSettlement::AlreadySettled(refund));
        }
        if !order.status.is_refundable() {
            return Ok(RefundSettlement::OrderNotRefundable(order.status));
        }

        let settled = order.settled_amount.unwrap_or(order.amount);
        let succeeded: i64 = refunds
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

        let row = sqlx::query_as::<_, RefundRow>(&format!(
            r#"
            UPDATE refunds
            SET status = $3,
                provider_refund_id = COALESCE(provider_refund_id, $4),
                settled_at = NOW(),
                updated_at = NOW()
            WHERE refund_ref = $1 AND order_ref = $2 AND status = 'REQUESTED'
            RETURNING {}
            "#,
            REFUND_COLUMNS
        ))
        .bind(refund_ref)
        .bind(order_ref)
        .bind(update.status.as_str())
        .bind(&update.provider_refund_id)
        .fetch_one(&mut *tx)
        .await?;

        let fully_refunded = succeeding && succeeded + refund.amount == settled;
        let order_status = if fully_refunded && order.status.can_transition_to(OrderStatus::Refunded) {
            sqlx::query(
                r#"
                UPDATE orders
                SET status = 'REFUNDED', updated_at = NOW()
                WHERE order_ref = $1 AND status = 'REFUNDING'
                "#,
            )
            .bind(order_ref)
            .execute(&mut *tx)
            .await?;
            OrderStatus::Refunded
        } else {
            order.status
        };

        tx.commit().await?;
        Ok(RefundSettlement::Applied {
            refund: Refund::try_from(row)?,
            order_status,
        })
    }
}
