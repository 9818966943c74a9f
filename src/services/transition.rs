//! Idempotent Transition Engine
//!
//! The single writer of order settlement state. Every transition is a
//! conditional update against the expected current status, so duplicate or
//! concurrent deliveries of the same event apply at most once. The dedup
//! lock in front of this only saves work; this is the correctness backstop.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::database::{
    NewRefund, Order, OrderStatus, OrderStore, OrderUpdate, Refund, RefundCreation,
    RefundSettlement, RefundStatus, RefundUpdate, StoreError,
};
use crate::log_transition;
use crate::payments::{EventOutcome, RefundOutcome, VerifiedEvent};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Largest |settled - requested| (minor units) accepted without review
    pub amount_tolerance: i64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self { amount_tolerance: 0 }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("refund not found: {0}")]
    RefundNotFound(String),

    #[error("refund exceeds refundable amount for {order_ref}: available={available}, requested={requested}")]
    RefundExceedsSettled {
        order_ref: String,
        available: i64,
        requested: i64,
    },

    #[error("invalid refund: {0}")]
    InvalidRefund(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

// ============================================================================
// Engine
// ============================================================================

/// Result of `apply`. `applied == false` means the event was already handled.
#[derive(Debug, Clone)]
pub struct Transition {
    pub applied: bool,
    pub order: Order,
    pub refund: Option<Refund>,
    pub needs_review: bool,
}

impl Transition {
    fn skipped(order: Order, refund: Option<Refund>) -> Self {
        Self {
            applied: false,
            needs_review: order.needs_review,
            order,
            refund,
        }
    }
}

pub struct TransitionEngine {
    store: Arc<dyn OrderStore>,
    config: TransitionConfig,
}

impl TransitionEngine {
    pub fn new(store: Arc<dyn OrderStore>, config: TransitionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Applies a verified event to its order exactly once.
    #[instrument(skip(self, event), fields(provider = %event.provider, kind = %event.kind()))]
    pub async fn apply(
        &self,
        order_ref: &str,
        event: &VerifiedEvent,
    ) -> Result<Transition, TransitionError> {
        if event.order_ref != order_ref {
            return Err(TransitionError::InvalidEvent(format!(
                "event for {} applied to {}",
                event.order_ref, order_ref
            )));
        }

        let order = self
            .store
            .find_order(order_ref)
            .await?
            .ok_or_else(|| TransitionError::OrderNotFound(order_ref.to_string()))?;

        if order.provider != event.provider {
            return Err(TransitionError::InvalidEvent(format!(
                "order {} belongs to {}, event came from {}",
                order_ref, order.provider, event.provider
            )));
        }

        match &event.outcome {
            EventOutcome::Paid | EventOutcome::PaymentFailed { .. } => {
                self.apply_payment(order, event).await
            }
            EventOutcome::Refund(refund) => self.apply_refund(order, event, refund).await,
        }
    }

    async fn apply_payment(
        &self,
        order: Order,
        event: &VerifiedEvent,
    ) -> Result<Transition, TransitionError> {
        if order.status != OrderStatus::Pending {
            debug!(
                order_ref = %order.order_ref,
                status = %order.status,
                "Payment event already processed"
            );
            return Ok(Transition::skipped(order, None));
        }

        let (target, settled_amount, needs_review) = match &event.outcome {
            EventOutcome::Paid => {
                let settled = match event.settled_amount {
                    Some(amount) => amount,
                    None => {
                        warn!(order_ref = %order.order_ref, "Paid event without amount, using requested amount");
                        order.amount
                    }
                };
                let needs_review = self.review_amount(&order, settled);
                (OrderStatus::Paid, Some(settled), needs_review)
            }
            EventOutcome::PaymentFailed { reason } => {
                info!(
                    order_ref = %order.order_ref,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "Provider reported payment failure"
                );
                (OrderStatus::Failed, None, false)
            }
            EventOutcome::Refund(_) => {
                return Err(TransitionError::InvalidEvent("refund routed as payment".to_string()));
            }
        };

        let update = OrderUpdate {
            status: target,
            settled_amount,
            provider_txn_id: event.provider_txn_id.clone(),
            needs_review,
            settled_at: Some(event.event_time.unwrap_or_else(Utc::now)),
        };

        match self
            .store
            .compare_and_set_order(&order.order_ref, OrderStatus::Pending, update)
            .await?
        {
            Some(updated) => {
                log_transition!(
                    order_ref = updated.order_ref,
                    provider = updated.provider,
                    from = OrderStatus::Pending,
                    to = updated.status,
                );
                Ok(Transition {
                    applied: true,
                    needs_review: updated.needs_review,
                    order: updated,
                    refund: None,
                })
            }
            None => {
                // Lost the race to a concurrent writer
                debug!(order_ref = %order.order_ref, "Conditional update did not apply");
                let current = self
                    .store
                    .find_order(&order.order_ref)
                    .await?
                    .ok_or_else(|| TransitionError::OrderNotFound(order.order_ref.clone()))?;
                Ok(Transition::skipped(current, None))
            }
        }
    }

    /// Mismatches are recorded; beyond the tolerance the order is flagged for review.
    fn review_amount(&self, order: &Order, settled: i64) -> bool {
        let diff = (settled - order.amount).abs();
        if diff == 0 {
            return false;
        }
        if diff > self.config.amount_tolerance {
            warn!(
                order_ref = %order.order_ref,
                requested = order.amount,
                settled,
                tolerance = self.config.amount_tolerance,
                "Settled amount outside tolerance, flagging order for manual review"
            );
            true
        } else {
            info!(
                order_ref = %order.order_ref,
                requested = order.amount,
                settled,
                "Settled amount differs from requested amount within tolerance"
            );
            false
        }
    }

    async fn apply_refund(
        &self,
        order: Order,
        event: &VerifiedEvent,
        outcome: &RefundOutcome,
    ) -> Result<Transition, TransitionError> {
        let update = RefundUpdate {
            status: if outcome.succeeded {
                RefundStatus::Succeeded
            } else {
                RefundStatus::Failed
            },
            provider_refund_id: outcome.provider_refund_id.clone(),
        };

        let settlement = self
            .store
            .settle_refund(&order.order_ref, &outcome.refund_ref, update)
            .await?;

        match settlement {
            RefundSettlement::Applied {
                refund,
                order_status,
            } => {
                if let Some(reported) = event.settled_amount {
                    if reported != refund.amount {
                        warn!(
                            order_ref = %order.order_ref,
                            refund_ref = %refund.refund_ref,
                            requested = refund.amount,
                            reported,
                            "Provider reported a different refund amount"
                        );
                    }
                }
                log_transition!(
                    order_ref = order.order_ref,
                    refund_ref = refund.refund_ref,
                    refund_status = refund.status,
                    from = order.status,
                    to = order_status,
                );
                let order = self
                    .store
                    .find_order(&order.order_ref)
                    .await?
                    .ok_or_else(|| TransitionError::OrderNotFound(order.order_ref.clone()))?;
                Ok(Transition {
                    applied: true,
                    needs_review: order.needs_review,
                    order,
                    refund: Some(refund),
                })
            }
            RefundSettlement::AlreadySettled(refund) => {
                debug!(
                    order_ref = %order.order_ref,
                    refund_ref = %refund.refund_ref,
                    status = %refund.status,
                    "Refund event already processed"
                );
                Ok(Transition::skipped(order, Some(refund)))
            }
            RefundSettlement::OrderNotFound => Err(TransitionError::OrderNotFound(order.order_ref)),
            RefundSettlement::RefundNotFound => {
                Err(TransitionError::RefundNotFound(outcome.refund_ref.clone()))
            }
            RefundSettlement::OrderNotRefundable(status) => Err(TransitionError::InvalidRefund(
                format!("order {} is {}", order.order_ref, status),
            )),
            RefundSettlement::ExceedsSettled {
                settled,
                succeeded,
                requested,
            } => {
                warn!(
                    order_ref = %order.order_ref,
                    refund_ref = %outcome.refund_ref,
                    settled,
                    succeeded,
                    requested,
                    "Refund would exceed settled amount, rejected"
                );
                Err(TransitionError::RefundExceedsSettled {
                    order_ref: order.order_ref,
                    available: settled - succeeded,
                    requested,
                })
            }
        }
    }

    /// Records a REQUESTED refund, moving the order PAID -> REFUNDING.
    /// Re-sending the same refund reference with the same amount is idempotent.
    #[instrument(skip(self, refund), fields(order_ref = %refund.order_ref, refund_ref = %refund.refund_ref))]
    pub async fn request_refund(&self, refund: NewRefund) -> Result<Refund, TransitionError> {
        if refund.amount <= 0 {
            return Err(TransitionError::InvalidRefund(
                "refund amount must be positive".to_string(),
            ));
        }
        let order_ref = refund.order_ref.clone();
        let amount = refund.amount;

        match self.store.create_refund(refund).await? {
            RefundCreation::Created(refund) => {
                info!(amount = refund.amount, "Refund requested");
                Ok(refund)
            }
            RefundCreation::Existing(existing)
                if existing.order_ref == order_ref && existing.amount == amount =>
            {
                debug!("Refund request replayed");
                Ok(existing)
            }
            RefundCreation::Existing(existing) => Err(TransitionError::InvalidRefund(format!(
                "refund reference {} already used",
                existing.refund_ref
            ))),
            RefundCreation::OrderNotFound => Err(TransitionError::OrderNotFound(order_ref)),
            RefundCreation::NotRefundable(status) => Err(TransitionError::InvalidRefund(format!(
                "order {} is {}",
                order_ref, status
            ))),
            RefundCreation::ExceedsRefundable { remaining } => {
                Err(TransitionError::RefundExceedsSettled {
                    order_ref,
                    available: remaining,
                    requested: amount,
                })
            }
        }
    }
}
