//! Aggregate order synchronizer.
//!
//! Runs inside every transaction that writes a sub-order status, after the
//! sub-order row has been written, so the aggregate row is always locked second.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::events::Outbox;
use crate::models::{AggregateOrder, OrderStatus, OrderingMode, PaymentMethod, PaymentStatus};
use crate::store::Repository;

/// Aggregate status implied by the statuses of its sub-orders.
pub fn roll_up(mode: OrderingMode, statuses: &[OrderStatus]) -> OrderStatus {
    let live: Vec<OrderStatus> = statuses
        .iter()
        .copied()
        .filter(|s| !matches!(s, OrderStatus::Cancelled | OrderStatus::Rejected))
        .collect();
    let any_rejected = statuses.contains(&OrderStatus::Rejected);

    if mode.is_approval_gated() {
        if any_rejected {
            OrderStatus::Rejected
        } else if live.is_empty() {
            OrderStatus::Cancelled
        } else if live.iter().all(|s| *s == OrderStatus::Confirmed) {
            OrderStatus::Confirmed
        } else if live.contains(&OrderStatus::PendingApproval) {
            OrderStatus::PendingApproval
        } else {
            OrderStatus::Pending
        }
    } else {
        match live.iter().min_by_key(|s| s.rank()) {
            Some(least_advanced) => *least_advanced,
            None if any_rejected => OrderStatus::Rejected,
            None => OrderStatus::Cancelled,
        }
    }
}

pub fn roll_up_payment(
    status: OrderStatus,
    method: PaymentMethod,
    current: PaymentStatus,
) -> PaymentStatus {
    match (status, current) {
        (OrderStatus::Cancelled | OrderStatus::Rejected, PaymentStatus::Paid) => {
            PaymentStatus::RefundPending
        }
        (OrderStatus::Delivered, PaymentStatus::Pending)
            if method == PaymentMethod::CashOnDelivery =>
        {
            PaymentStatus::Paid
        }
        _ => current,
    }
}

/// Recomputes and persists the aggregate status under the aggregate row lock.
/// A terminal aggregate is returned untouched.
pub(crate) fn synchronize<R: Repository>(
    repo: &mut R,
    aggregate_order_id: Uuid,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<AggregateOrder> {
    let mut order = repo.lock_aggregate_order(aggregate_order_id)?;
    if order.status.is_terminal() {
        return Ok(order);
    }

    let statuses: Vec<OrderStatus> = repo
        .sub_orders_of(aggregate_order_id)?
        .iter()
        .map(|s| s.status)
        .collect();
    let status = roll_up(order.ordering_mode, &statuses);
    let payment_status = roll_up_payment(status, order.payment_method, order.payment_status);
    if status == order.status && payment_status == order.payment_status {
        return Ok(order);
    }

    let previous = order.status;
    order.status = status;
    order.payment_status = payment_status;
    order.updated_at = now;
    repo.save_aggregate_order(&order)?;
    tracing::debug!(
        aggregate_order_id = %order.id,
        %previous,
        status = %order.status,
        payment_status = %order.payment_status,
        "aggregate order synchronized"
    );

    if order.ordering_mode.is_approval_gated() && status != previous {
        outbox.preorder_decided(&order);
    }
    Ok(order)
}
