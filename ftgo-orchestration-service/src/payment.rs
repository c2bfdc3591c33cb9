use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::error::{log_failure, OrchestrationError, Result};
use crate::events::{Notifier, Outbox};
use crate::models::{AggregateOrder, OrderStatus, PaymentMethod, PaymentStatus};
use crate::retry::retry_on_conflict;
use crate::state_machine::{transition_optimistic, Actor};
use crate::store::{Repository, Store};
use crate::sync::synchronize;

pub struct PaymentDesk<S> {
    store: Arc<S>,
    dispatcher: Dispatcher<S>,
    notifier: Notifier,
    settings: Settings,
}

impl<S: Store> PaymentDesk<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Dispatcher<S>,
        notifier: Notifier,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            settings,
        }
    }

    /// Moves every sub-order out of `PENDING`: deliveries to `CONFIRMED`, the
    /// rest to `PENDING_APPROVAL`. Delivery sub-orders are broadcast once the
    /// payment has committed; a failed broadcast is left to the expiry sweep.
    #[instrument(skip(self))]
    pub fn confirm_payment(&self, aggregate_order_id: Uuid) -> Result<AggregateOrder> {
        let (order, dispatchable, outbox) = retry_on_conflict(
            "confirm_payment",
            self.settings.conflict_retries,
            || self.try_confirm(aggregate_order_id),
        )
        .map_err(|err| log_failure("confirm_payment", err))?;

        tracing::info!(%aggregate_order_id, status = %order.status, "payment confirmed");
        self.notifier.publish(outbox);

        for sub_order_id in dispatchable {
            if let Err(err) = self.dispatcher.broadcast(sub_order_id) {
                tracing::warn!(%sub_order_id, error = %err, "broadcast after payment failed");
            }
        }
        Ok(order)
    }

    fn try_confirm(&self, aggregate_order_id: Uuid) -> Result<(AggregateOrder, Vec<Uuid>, Outbox)> {
        self.store.transaction(|repo| {
            let now = Utc::now();
            let order = repo.get_aggregate_order(aggregate_order_id)?;
            if order.status != OrderStatus::Pending || order.payment_status != PaymentStatus::Pending
            {
                return Err(OrchestrationError::InvalidTransition {
                    from: order.status,
                    to: OrderStatus::Confirmed,
                });
            }

            let mut outbox = Outbox::default();
            let mut updated = Vec::new();
            for current in repo.sub_orders_of(aggregate_order_id)? {
                if current.status != OrderStatus::Pending {
                    return Err(OrchestrationError::InvalidTransition {
                        from: current.status,
                        to: OrderStatus::Confirmed,
                    });
                }
                let target = if current.fulfillment.requires_approval() {
                    OrderStatus::PendingApproval
                } else {
                    OrderStatus::Confirmed
                };
                let next = transition_optimistic(
                    repo,
                    &current,
                    order.user_id,
                    target,
                    Actor::System,
                    now,
                    &self.settings,
                )?;
                updated.push((current.status, next));
            }

            if order.payment_method == PaymentMethod::Card {
                let mut locked = repo.lock_aggregate_order(aggregate_order_id)?;
                locked.payment_status = PaymentStatus::Paid;
                locked.updated_at = now;
                repo.save_aggregate_order(&locked)?;
            }
            let order = synchronize(repo, aggregate_order_id, now, &mut outbox)?;

            let mut dispatchable = Vec::new();
            for (previous, next) in &updated {
                outbox.status_updated(&order, next, *previous);
                if next.fulfillment.is_dispatchable() {
                    dispatchable.push(next.id);
                }
            }
            Ok((order, dispatchable, outbox))
        })
    }
}
