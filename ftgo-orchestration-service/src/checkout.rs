//! Server-side pending checkouts.
//!
//! A checkout is parked as a short-lived row keyed by an opaque token, so any
//! instance can complete it. Completing consumes the row and decomposes the
//! cart in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::config::Settings;
use crate::decomposition::{decompose_in, plan_order, Cart, Catalog, DeliveryMeta, OrderDecomposer};
use crate::error::{log_failure, OrchestrationError, Result};
use crate::events::{Notifier, Outbox};
use crate::models::{AggregateOrder, PendingCheckout};
use crate::store::{Repository, Store, StoreError};

#[derive(Serialize, Deserialize)]
struct CheckoutPayload {
    cart: Cart,
    meta: DeliveryMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutToken {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub struct CheckoutDesk<S, C> {
    store: Arc<S>,
    catalog: Arc<C>,
    notifier: Notifier,
    settings: Settings,
}

impl<S: Store, C: Catalog> CheckoutDesk<S, C> {
    pub fn new(decomposer: &OrderDecomposer<S, C>, settings: Settings) -> Self {
        Self {
            store: decomposer.store.clone(),
            catalog: decomposer.catalog.clone(),
            notifier: decomposer.notifier.clone(),
            settings,
        }
    }

    /// Parks the cart and returns the token that completes it.
    #[instrument(skip(self))]
    pub fn begin(&self, cart: Cart, meta: DeliveryMeta) -> Result<CheckoutToken> {
        plan_order(self.catalog.as_ref(), &cart, &meta)
            .map_err(|err| log_failure("begin_checkout", err))?;

        let now = Utc::now();
        let token = Uuid::new_v4();
        let user_id = cart.user_id;
        let payload = serde_json::to_value(CheckoutPayload { cart, meta })
            .map_err(|err| OrchestrationError::InvalidRequest(err.to_string()))?;
        let checkout = PendingCheckout {
            token: token.to_string(),
            user_id,
            payload,
            expires_at: now + self.settings.checkout_ttl,
            created_at: now,
        };
        self.store
            .transaction(|repo| {
                repo.insert_checkout(&checkout)?;
                Ok(())
            })
            .map_err(|err| log_failure("begin_checkout", err))?;

        Ok(CheckoutToken {
            token,
            expires_at: checkout.expires_at,
        })
    }

    /// Consumes the checkout and creates the order. A failure leaves the
    /// checkout in place for a retry until it expires.
    #[instrument(skip(self))]
    pub fn complete(&self, token: Uuid, user_id: Uuid) -> Result<AggregateOrder> {
        let (order, outbox) = self
            .store
            .transaction(|repo| {
                let now = Utc::now();
                let checkout = repo
                    .take_checkout(&token.to_string())?
                    .ok_or(OrchestrationError::NotFound {
                        entity: "checkout",
                        id: token,
                    })?;
                if checkout.expires_at <= now {
                    return Err(OrchestrationError::CheckoutExpired);
                }
                if checkout.user_id != user_id {
                    return Err(OrchestrationError::AccessDenied(format!(
                        "checkout {} belongs to another user",
                        token
                    )));
                }
                let payload: CheckoutPayload = serde_json::from_value(checkout.payload)
                    .map_err(|err| StoreError::Corrupt(format!("checkout {}: {}", token, err)))?;

                let plan = plan_order(self.catalog.as_ref(), &payload.cart, &payload.meta)?;
                let mut outbox = Outbox::default();
                let order = decompose_in(repo, &plan, now, &mut outbox)?;
                Ok((order, outbox))
            })
            .map_err(|err| log_failure("complete_checkout", err))?;

        tracing::info!(%token, aggregate_order_id = %order.id, "checkout completed");
        self.notifier.publish(outbox);
        Ok(order)
    }

    /// Drops checkouts past their expiry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        purge_expired_checkouts(self.store.as_ref())
    }
}

/// Drops checkouts past their expiry. Needs only the store, so the sweep can
/// run it without a catalog.
pub fn purge_expired_checkouts<S: Store>(store: &S) -> Result<usize> {
    let purged = store
        .transaction(|repo| Ok(repo.purge_checkouts(Utc::now())?))
        .map_err(|err| log_failure("purge_checkouts", err))?;
    if purged > 0 {
        tracing::info!(purged, "expired checkouts purged");
    }
    Ok(purged)
}
