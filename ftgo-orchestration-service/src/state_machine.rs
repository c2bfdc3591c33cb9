//! Sub-order state machine.
//!
//! ```text
//! PENDING ─┬─> CONFIRMED ──> OFFERED ──> ACCEPTED ──> PREPARING ──> OUT_FOR_DELIVERY ──> DELIVERED
//!          └─> PENDING_APPROVAL ──> CONFIRMED                       (delivery only past CONFIRMED)
//! PENDING | PENDING_APPROVAL ──> REJECTED
//! any non-terminal ──> CANCELLED
//! ```
//!
//! Requested transitions go through [`validate_request`] and are persisted
//! with a version compare-and-swap. `ACCEPTED` is only reachable through
//! rider arbitration in [`crate::dispatch`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{log_failure, OrchestrationError, Result};
use crate::events::{Notifier, Outbox};
use crate::ledger::release_in;
use crate::models::{Fulfillment, OrderStatus, RiderStatus, SubOrder};
use crate::retry::retry_on_conflict;
use crate::store::{Repository, Store};
use crate::sync::synchronize;

/// Who is asking for a transition.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Actor {
    Customer(Uuid),
    Vendor(Uuid),
    Rider(Uuid),
    System,
}

/// Whether the lifecycle has an edge `from -> to` for this kind of fulfillment.
pub fn is_legal_edge(from: OrderStatus, to: OrderStatus, fulfillment: &Fulfillment) -> bool {
    use OrderStatus::*;

    if from.is_terminal() {
        return false;
    }
    let delivery = fulfillment.is_dispatchable();
    match (from, to) {
        (_, Cancelled) => true,
        (Pending | PendingApproval, Rejected) => true,
        (Pending, PendingApproval) => !delivery,
        (Pending, Confirmed) => delivery,
        (PendingApproval, Confirmed) => !delivery,
        (Confirmed, Offered) => delivery,
        (Confirmed | Offered, Accepted) => delivery,
        (Accepted, Preparing) => delivery,
        (Preparing, OutForDelivery) => true,
        (OutForDelivery, Delivered) => true,
        _ => false,
    }
}

fn permits(actor: Actor, sub_order: &SubOrder, customer_id: Uuid, to: OrderStatus) -> bool {
    use OrderStatus::*;

    match actor {
        Actor::System => matches!(to, PendingApproval | Confirmed | Offered | Cancelled),
        Actor::Customer(id) => id == customer_id && to == Cancelled,
        Actor::Vendor(id) => {
            id == sub_order.vendor_id
                && match to {
                    Confirmed => sub_order.fulfillment.requires_approval(),
                    Rejected | Preparing | OutForDelivery | Cancelled => true,
                    _ => false,
                }
        }
        Actor::Rider(id) => {
            sub_order.rider_id == Some(id) && matches!(to, OutForDelivery | Delivered)
        }
    }
}

/// Checks a requested transition. Failures come in a fixed order: terminal
/// source, `ACCEPTED` target, permission, missing rider, then edge legality.
pub fn validate_request(
    sub_order: &SubOrder,
    customer_id: Uuid,
    to: OrderStatus,
    actor: Actor,
) -> Result<()> {
    let from = sub_order.status;
    if from.is_terminal() || to == OrderStatus::Accepted {
        return Err(OrchestrationError::InvalidTransition { from, to });
    }
    if !permits(actor, sub_order, customer_id, to) {
        return Err(OrchestrationError::AccessDenied(format!(
            "{:?} may not move sub-order {} to {}",
            actor, sub_order.id, to
        )));
    }
    if to == OrderStatus::Preparing && sub_order.rider_id.is_none() {
        return Err(OrchestrationError::RiderRequired {
            sub_order_id: sub_order.id,
        });
    }
    if !is_legal_edge(from, to, &sub_order.fulfillment) {
        return Err(OrchestrationError::InvalidTransition { from, to });
    }
    Ok(())
}

/// Next version of `current` in status `to`, with the timestamps that status stamps.
pub(crate) fn advance(
    current: &SubOrder,
    to: OrderStatus,
    now: DateTime<Utc>,
    settings: &Settings,
) -> SubOrder {
    let mut next = current.next_version(now);
    next.status = to;
    match to {
        OrderStatus::Preparing => {
            next.preparation_start_time = Some(now);
            next.estimated_delivery_time = Some(now + settings.estimated_delivery);
        }
        OrderStatus::Delivered => next.actual_delivery_time = Some(now),
        _ => {}
    }
    next
}

/// Writes that accompany a status change in the same transaction: freeing the
/// rider and giving back reserved capacity.
pub(crate) fn apply_side_effects<R: Repository>(
    repo: &mut R,
    next: &SubOrder,
    now: DateTime<Utc>,
) -> Result<()> {
    match next.status {
        OrderStatus::Delivered | OrderStatus::Cancelled => {
            if let Some(rider_id) = next.rider_id {
                set_rider_status(repo, rider_id, RiderStatus::Idle, now)?;
            }
        }
        _ => {}
    }
    if matches!(next.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
        if let Some(slot_id) = next.fulfillment.slot_id() {
            if !release_in(repo, slot_id)? {
                tracing::warn!(sub_order_id = %next.id, %slot_id, "slot had nothing to release");
            }
        }
    }
    Ok(())
}

pub(crate) fn set_rider_status<R: Repository>(
    repo: &mut R,
    rider_id: Uuid,
    status: RiderStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut rider = repo.lock_rider(rider_id)?;
    rider.status = status;
    rider.updated_at = now;
    repo.save_rider(&rider)?;
    Ok(())
}

/// Validates, then writes with a version compare-and-swap.
pub(crate) fn transition_optimistic<R: Repository>(
    repo: &mut R,
    current: &SubOrder,
    customer_id: Uuid,
    to: OrderStatus,
    actor: Actor,
    now: DateTime<Utc>,
    settings: &Settings,
) -> Result<SubOrder> {
    validate_request(current, customer_id, to, actor)?;
    let next = advance(current, to, now, settings);
    if !repo.compare_and_swap_sub_order(current.version, &next)? {
        return Err(OrchestrationError::ConcurrencyConflict {
            sub_order_id: current.id,
        });
    }
    apply_side_effects(repo, &next, now)?;
    Ok(next)
}

pub struct SubOrderWorkflow<S> {
    store: Arc<S>,
    notifier: Notifier,
    settings: Settings,
}

impl<S: Store> SubOrderWorkflow<S> {
    pub fn new(store: Arc<S>, notifier: Notifier, settings: Settings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    /// Requests a status change on behalf of `actor`. Version conflicts are
    /// retried a bounded number of times before surfacing.
    #[instrument(skip(self))]
    pub fn update_status(
        &self,
        sub_order_id: Uuid,
        status: OrderStatus,
        actor: Actor,
    ) -> Result<SubOrder> {
        let (sub_order, outbox) = retry_on_conflict(
            "update_status",
            self.settings.conflict_retries,
            || self.try_update_status(sub_order_id, status, actor),
        )
        .map_err(|err| log_failure("update_status", err))?;

        tracing::info!(%sub_order_id, status = %sub_order.status, "sub-order status updated");
        self.notifier.publish(outbox);
        Ok(sub_order)
    }

    fn try_update_status(
        &self,
        sub_order_id: Uuid,
        status: OrderStatus,
        actor: Actor,
    ) -> Result<(SubOrder, Outbox)> {
        self.store.transaction(|repo| {
            let now = Utc::now();
            let current = repo.get_sub_order(sub_order_id)?;
            let customer_id = repo.get_aggregate_order(current.aggregate_order_id)?.user_id;
            let next =
                transition_optimistic(repo, &current, customer_id, status, actor, now, &self.settings)?;

            let mut outbox = Outbox::default();
            let order = synchronize(repo, next.aggregate_order_id, now, &mut outbox)?;
            outbox.status_updated(&order, &next, current.status);
            Ok((next, outbox))
        })
    }

    /// Vendor approval of a sub-order awaiting it.
    pub fn approve(&self, sub_order_id: Uuid, vendor_id: Uuid) -> Result<SubOrder> {
        self.update_status(sub_order_id, OrderStatus::Confirmed, Actor::Vendor(vendor_id))
    }

    pub fn reject(&self, sub_order_id: Uuid, vendor_id: Uuid) -> Result<SubOrder> {
        self.update_status(sub_order_id, OrderStatus::Rejected, Actor::Vendor(vendor_id))
    }

    pub fn cancel(&self, sub_order_id: Uuid, actor: Actor) -> Result<SubOrder> {
        self.update_status(sub_order_id, OrderStatus::Cancelled, actor)
    }

    pub fn get(&self, sub_order_id: Uuid) -> Result<SubOrder> {
        self.store
            .transaction(|repo| Ok(repo.get_sub_order(sub_order_id)?))
            .map_err(|err| log_failure("get_sub_order", err))
    }
}
