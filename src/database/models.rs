//! Order and refund records
//!
//! Status columns are stored as upper-case text; rows are decoded through
//! `*Row` structs and validated into the typed models here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::StoreError;
use crate::payments::ProviderName;

// ============================================================================
// Order status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Refunding,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Refunding => "REFUNDING",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "PAID" => Some(OrderStatus::Paid),
            "FAILED" => Some(OrderStatus::Failed),
            "REFUNDING" => Some(OrderStatus::Refunding),
            "REFUNDED" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Allowed forward edges. Nothing ever returns to PENDING, and refunds
    /// always pass through REFUNDING.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Paid, OrderStatus::Refunding)
                | (OrderStatus::Refunding, OrderStatus::Refunded)
        )
    }

    /// Whether refunds may be requested or settled against the order
    pub fn is_refundable(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Refunding)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Refunded)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Refund status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Requested,
    Succeeded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Requested => "REQUESTED",
            RefundStatus::Succeeded => "SUCCEEDED",
            RefundStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "REQUESTED" => Some(RefundStatus::Requested),
            "SUCCEEDED" => Some(RefundStatus::Succeeded),
            "FAILED" => Some(RefundStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: RefundStatus) -> bool {
        matches!(
            (self, next),
            (RefundStatus::Requested, RefundStatus::Succeeded)
                | (RefundStatus::Requested, RefundStatus::Failed)
        )
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub order_ref: String,
    pub app_id: String,
    pub provider: ProviderName,
    pub provider_txn_id: Option<String>,
    /// Requested amount in minor units
    pub amount: i64,
    pub currency: String,
    pub callback_url: String,
    pub status: OrderStatus,
    pub settled_amount: Option<i64>,
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub id: i64,
    pub refund_ref: String,
    pub order_ref: String,
    pub amount: i64,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_ref: String,
    pub app_id: String,
    pub provider: ProviderName,
    pub amount: i64,
    pub currency: String,
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub refund_ref: String,
    pub order_ref: String,
    pub amount: i64,
    pub reason: Option<String>,
}

/// Fields written by a settlement. `settled_amount` and `provider_txn_id`
/// are only filled when still empty.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub status: OrderStatus,
    pub settled_amount: Option<i64>,
    pub provider_txn_id: Option<String>,
    pub needs_review: bool,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RefundUpdate {
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundCreation {
    Created(Refund),
    /// Same refund reference was already recorded
    Existing(Refund),
    OrderNotFound,
    NotRefundable(OrderStatus),
    ExceedsRefundable { remaining: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundSettlement {
    Applied {
        refund: Refund,
        order_status: OrderStatus,
    },
    AlreadySettled(Refund),
    OrderNotFound,
    RefundNotFound,
    OrderNotRefundable(OrderStatus),
    ExceedsSettled {
        settled: i64,
        succeeded: i64,
        requested: i64,
    },
}

/// Amount still open for new refund requests: settled minus succeeded minus
/// outstanding requests.
pub fn refundable_remaining(order: &Order, refunds: &[Refund]) -> i64 {
    let settled = order.settled_amount.unwrap_or(order.amount);
    let committed: i64 = refunds
        .iter()
        .filter(|r| r.order_ref == order.order_ref)
        .filter(|r| matches!(r.status, RefundStatus::Requested | RefundStatus::Succeeded))
        .map(|r| r.amount)
        .sum();
    settled - committed
}

// ============================================================================
// Row decoding
// ============================================================================

#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: i64,
    pub order_ref: String,
    pub app_id: String,
    pub provider: String,
    pub provider_txn_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub callback_url: String,
    pub status: String,
    pub settled_amount: Option<i64>,
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::from_str(&row.status)
            .ok_or_else(|| StoreError::corrupt(format!("order status {}", row.status)))?;
        let provider = row
            .provider
            .parse()
            .map_err(|_| StoreError::corrupt(format!("order provider {}", row.provider)))?;

        Ok(Order {
            id: row.id,
            order_ref: row.order_ref,
            app_id: row.app_id,
            provider,
            provider_txn_id: row.provider_txn_id,
            amount: row.amount,
            currency: row.currency,
            callback_url: row.callback_url,
            status,
            settled_amount: row.settled_amount,
            needs_review: row.needs_review,
            created_at: row.created_at,
            updated_at: row.updated_at,
            settled_at: row.settled_at,
        })
    }
}

#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
#[derive(Debug, Clone)]
pub struct RefundRow {
    pub id: i64,
    pub refund_ref: String,
    pub order_ref: String,
    pub amount: i64,
    pub reason: Option<String>,
    pub status: String,
    pub provider_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = StoreError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        let status = RefundStatus::from_str(&row.status)
            .ok_or_else(|| StoreError::corrupt(format!("refund status {}", row.status)))?;

        Ok(Refund {
            id: row.id,
            refund_ref: row.refund_ref,
            order_ref: row.order_ref,
            amount: row.amount,
            reason: row.reason,
            status,
            provider_refund_id: row.provider_refund_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            settled_at: row.settled_at,
        })
    }
}
