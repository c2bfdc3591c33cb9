//! Rider dispatch and offer arbitration.
//!
//! Every rider assignment, whether from a broadcast offer or the available
//! orders board, runs [`claim_locked`] while holding the sub-order row lock.
//! Competing offers are not invalidated when one wins: a later attempt sees
//! the bound rider under the same lock and fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{log_failure, OrchestrationError, Result, UnavailableReason};
use crate::events::{Notifier, Outbox};
use crate::models::{Location, OfferStatus, OrderStatus, Rider, RiderOffer, RiderStatus, SubOrder};
use crate::state_machine::{is_legal_edge, set_rider_status, validate_request, Actor};
use crate::store::{Repository, Store};
use crate::sync::synchronize;

/// Outcome of a successful `accept`.
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub sub_order: SubOrder,
    /// `false` when the offer had already been accepted by the same rider.
    pub newly_assigned: bool,
}

pub struct Dispatcher<S> {
    store: Arc<S>,
    notifier: Notifier,
    settings: Settings,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(store: Arc<S>, notifier: Notifier, settings: Settings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    /// Offers a confirmed delivery sub-order to every eligible rider and moves
    /// it to `OFFERED`. Calling it again on an unclaimed `OFFERED` sub-order
    /// only adds offers for riders who have none outstanding.
    #[instrument(skip(self))]
    pub fn broadcast(&self, sub_order_id: Uuid) -> Result<Vec<RiderOffer>> {
        let (offers, outbox) = self
            .store
            .transaction(|repo| {
                let mut outbox = Outbox::default();
                let offers = broadcast_in(repo, sub_order_id, Utc::now(), &self.settings, &mut outbox)?;
                Ok((offers, outbox))
            })
            .map_err(|err| log_failure("broadcast", err))?;

        tracing::info!(%sub_order_id, offers = offers.len(), "sub-order broadcast");
        self.notifier.publish(outbox);
        Ok(offers)
    }

    /// Binds the offer's rider to its sub-order if nobody else got there first.
    #[instrument(skip(self))]
    pub fn accept(&self, offer_id: Uuid, rider_id: Uuid) -> Result<Acceptance> {
        let (acceptance, outbox) = self
            .store
            .transaction(|repo| {
                let now = Utc::now();
                let sub_order_id = repo.get_offer(offer_id)?.sub_order_id;
                let current = repo.lock_sub_order(sub_order_id)?;
                // Re-read under the lock.
                let offer = repo.get_offer(offer_id)?;

                if offer.rider_id != rider_id {
                    return Err(OrchestrationError::AccessDenied(format!(
                        "offer {} belongs to another rider",
                        offer_id
                    )));
                }
                if offer.status == OfferStatus::Accepted && current.rider_id == Some(rider_id) {
                    let acceptance = Acceptance {
                        sub_order: current,
                        newly_assigned: false,
                    };
                    return Ok((acceptance, Outbox::default()));
                }
                if offer.status != OfferStatus::Pending {
                    return Err(OrchestrationError::offer_unavailable(
                        offer_id,
                        UnavailableReason::AlreadyResolved,
                    ));
                }
                if offer.is_expired(now) {
                    return Err(OrchestrationError::offer_unavailable(
                        offer_id,
                        UnavailableReason::Expired,
                    ));
                }

                let mut outbox = Outbox::default();
                let sub_order = claim_locked(repo, current, &offer, now, &mut outbox)?;
                let acceptance = Acceptance {
                    sub_order,
                    newly_assigned: true,
                };
                Ok((acceptance, outbox))
            })
            .map_err(|err| log_failure("accept_offer", err))?;

        if acceptance.newly_assigned {
            tracing::info!(%offer_id, %rider_id, sub_order_id = %acceptance.sub_order.id, "offer accepted");
        }
        self.notifier.publish(outbox);
        Ok(acceptance)
    }

    /// Declines the rider's own pending offer. The sub-order is not touched.
    #[instrument(skip(self))]
    pub fn reject(&self, offer_id: Uuid, rider_id: Uuid) -> Result<RiderOffer> {
        self.store
            .transaction(|repo| {
                let offer = repo.get_offer(offer_id)?;
                if offer.rider_id != rider_id {
                    return Err(OrchestrationError::AccessDenied(format!(
                        "offer {} belongs to another rider",
                        offer_id
                    )));
                }
                if offer.status != OfferStatus::Pending {
                    return Err(OrchestrationError::offer_unavailable(
                        offer_id,
                        UnavailableReason::AlreadyResolved,
                    ));
                }
                if offer.is_expired(Utc::now()) {
                    return Err(OrchestrationError::offer_unavailable(
                        offer_id,
                        UnavailableReason::Expired,
                    ));
                }
                if !repo.transition_offer(offer_id, OfferStatus::Pending, OfferStatus::Rejected)? {
                    return Err(OrchestrationError::offer_unavailable(
                        offer_id,
                        UnavailableReason::AlreadyResolved,
                    ));
                }
                Ok(RiderOffer {
                    status: OfferStatus::Rejected,
                    ..offer
                })
            })
            .map_err(|err| log_failure("reject_offer", err))
    }

    /// Claims an unassigned sub-order straight from the available orders board.
    /// Uses the rider's live offer when there is one, otherwise records a new one.
    #[instrument(skip(self))]
    pub fn accept_available(&self, sub_order_id: Uuid, rider_id: Uuid) -> Result<Acceptance> {
        let (acceptance, outbox) = self
            .store
            .transaction(|repo| {
                let now = Utc::now();
                let current = repo.lock_sub_order(sub_order_id)?;
                let offers = repo.offers_for(sub_order_id)?;

                if let Some(offer) = offers
                    .iter()
                    .find(|o| o.rider_id == rider_id && o.status == OfferStatus::Accepted)
                {
                    if current.rider_id == Some(rider_id) {
                        let acceptance = Acceptance {
                            sub_order: current,
                            newly_assigned: false,
                        };
                        return Ok((acceptance, Outbox::default()));
                    }
                    return Err(OrchestrationError::offer_unavailable(
                        offer.id,
                        UnavailableReason::AlreadyResolved,
                    ));
                }
                if let Some(offer) = offers
                    .iter()
                    .find(|o| o.rider_id == rider_id && o.status == OfferStatus::Rejected)
                {
                    return Err(OrchestrationError::offer_unavailable(
                        offer.id,
                        UnavailableReason::AlreadyResolved,
                    ));
                }

                let offer = match offers
                    .into_iter()
                    .find(|o| o.rider_id == rider_id && o.is_live(now))
                {
                    Some(offer) => offer,
                    None => {
                        let offer = new_offer(sub_order_id, rider_id, now, &self.settings);
                        repo.insert_offers(std::slice::from_ref(&offer))?;
                        offer
                    }
                };

                let mut outbox = Outbox::default();
                let sub_order = claim_locked(repo, current, &offer, now, &mut outbox)?;
                let acceptance = Acceptance {
                    sub_order,
                    newly_assigned: true,
                };
                Ok((acceptance, outbox))
            })
            .map_err(|err| log_failure("accept_available", err))?;

        self.notifier.publish(outbox);
        Ok(acceptance)
    }

    /// Hands an accepted sub-order back: the rider is unbound, the sub-order
    /// returns to `OFFERED`, and the rider's offer is marked rejected.
    #[instrument(skip(self))]
    pub fn release(&self, sub_order_id: Uuid, rider_id: Uuid) -> Result<SubOrder> {
        let (sub_order, outbox) = self
            .store
            .transaction(|repo| {
                let now = Utc::now();
                let current = repo.lock_sub_order(sub_order_id)?;
                if current.rider_id != Some(rider_id) {
                    return Err(OrchestrationError::AccessDenied(format!(
                        "rider {} is not assigned to sub-order {}",
                        rider_id, sub_order_id
                    )));
                }
                if current.status != OrderStatus::Accepted {
                    return Err(OrchestrationError::InvalidTransition {
                        from: current.status,
                        to: OrderStatus::Offered,
                    });
                }

                let mut next = current.next_version(now);
                next.rider_id = None;
                next.status = OrderStatus::Offered;
                repo.write_locked_sub_order(&next)?;

                for offer in repo.offers_for(sub_order_id)? {
                    if offer.rider_id == rider_id && offer.status == OfferStatus::Accepted {
                        repo.transition_offer(offer.id, OfferStatus::Accepted, OfferStatus::Rejected)?;
                    }
                }
                set_rider_status(repo, rider_id, RiderStatus::Idle, now)?;

                let mut outbox = Outbox::default();
                let order = synchronize(repo, next.aggregate_order_id, now, &mut outbox)?;
                outbox.status_updated(&order, &next, current.status);
                outbox.rider_assignment_changed(&order, &next, rider_id, false);
                Ok((next, outbox))
            })
            .map_err(|err| log_failure("release", err))?;

        tracing::info!(%sub_order_id, %rider_id, "rider released sub-order");
        self.notifier.publish(outbox);
        Ok(sub_order)
    }

    /// Unclaimed sub-orders the rider may take from the board. Empty while the
    /// rider is offline or busy.
    pub fn available_orders(&self, rider_id: Uuid) -> Result<Vec<SubOrder>> {
        self.store
            .transaction(|repo| {
                let rider = repo.get_rider(rider_id)?;
                if !rider.is_eligible() {
                    return Ok(Vec::new());
                }
                let mut available = Vec::new();
                for sub_order in repo.unclaimed_sub_orders()? {
                    let declined = repo.offers_for(sub_order.id)?.iter().any(|o| {
                        o.rider_id == rider_id && o.status == OfferStatus::Rejected
                    });
                    if !declined {
                        available.push(sub_order);
                    }
                }
                Ok(available)
            })
            .map_err(|err| log_failure("available_orders", err))
    }

    pub fn register_rider(&self, name: &str) -> Result<Rider> {
        let rider = Rider {
            id: Uuid::new_v4(),
            name: name.to_string(),
            online: false,
            latitude: None,
            longitude: None,
            status: RiderStatus::Idle,
            updated_at: Utc::now(),
        };
        self.store
            .transaction(|repo| {
                repo.insert_rider(&rider)?;
                Ok(())
            })
            .map_err(|err| log_failure("register_rider", err))?;
        Ok(rider)
    }

    /// Going online or offline. A known `location` replaces the stored one.
    #[instrument(skip(self))]
    pub fn set_availability(
        &self,
        rider_id: Uuid,
        online: bool,
        location: Option<Location>,
    ) -> Result<Rider> {
        self.store
            .transaction(|repo| {
                let mut rider = repo.lock_rider(rider_id)?;
                rider.online = online;
                if let Some(location) = location {
                    rider.latitude = Some(location.latitude);
                    rider.longitude = Some(location.longitude);
                }
                rider.updated_at = Utc::now();
                repo.save_rider(&rider)?;
                Ok(rider)
            })
            .map_err(|err| log_failure("set_availability", err))
    }

    pub fn offers_for(&self, sub_order_id: Uuid) -> Result<Vec<RiderOffer>> {
        self.store
            .transaction(|repo| {
                repo.get_sub_order(sub_order_id)?;
                Ok(repo.offers_for(sub_order_id)?)
            })
            .map_err(|err| log_failure("offers_for", err))
    }

    /// Re-broadcasts unclaimed sub-orders whose offers have all lapsed, marking
    /// the lapsed ones `EXPIRED`. Confirmed delivery sub-orders that were never
    /// broadcast are offered for the first time. Returns how many sub-orders got
    /// new offers.
    pub fn redispatch_expired(&self) -> Result<usize> {
        let candidates = self
            .store
            .transaction(|repo| {
                let mut candidates = repo.unclaimed_sub_orders()?;
                candidates.extend(repo.undispatched_sub_orders()?);
                Ok(candidates)
            })
            .map_err(|err| log_failure("redispatch_expired", err))?;

        let mut redispatched = 0;
        for candidate in candidates {
            let result: Result<Option<(usize, Outbox)>> = self.store.transaction(|repo| {
                let now = Utc::now();
                let current = repo.lock_sub_order(candidate.id)?;
                if current.rider_id.is_some() {
                    return Ok(None);
                }
                match current.status {
                    OrderStatus::Offered => {
                        let offers = repo.offers_for(current.id)?;
                        if offers.iter().any(|o| o.is_live(now)) {
                            return Ok(None);
                        }
                        for offer in offers.iter().filter(|o| o.status == OfferStatus::Pending) {
                            repo.transition_offer(
                                offer.id,
                                OfferStatus::Pending,
                                OfferStatus::Expired,
                            )?;
                        }
                    }
                    OrderStatus::Confirmed => {}
                    _ => return Ok(None),
                }

                let mut outbox = Outbox::default();
                let offers = broadcast_in(repo, current.id, now, &self.settings, &mut outbox)?;
                Ok(Some((offers.len(), outbox)))
            });

            match result {
                Ok(Some((offers, outbox))) => {
                    if offers > 0 {
                        redispatched += 1;
                    }
                    tracing::info!(sub_order_id = %candidate.id, offers, "sub-order re-broadcast");
                    self.notifier.publish(outbox);
                }
                Ok(None) => {}
                Err(err) => {
                    log_failure("redispatch_expired", err);
                }
            }
        }
        Ok(redispatched)
    }
}

fn new_offer(
    sub_order_id: Uuid,
    rider_id: Uuid,
    now: DateTime<Utc>,
    settings: &Settings,
) -> RiderOffer {
    RiderOffer {
        id: Uuid::new_v4(),
        sub_order_id,
        rider_id,
        status: OfferStatus::Pending,
        expires_at: now + settings.offer_ttl,
        created_at: now,
    }
}

pub(crate) fn broadcast_in<R: Repository>(
    repo: &mut R,
    sub_order_id: Uuid,
    now: DateTime<Utc>,
    settings: &Settings,
    outbox: &mut Outbox,
) -> Result<Vec<RiderOffer>> {
    let current = repo.lock_sub_order(sub_order_id)?;
    if !current.fulfillment.is_dispatchable() {
        return Err(OrchestrationError::NotDispatchable { sub_order_id });
    }
    let rebroadcast = current.status == OrderStatus::Offered && current.rider_id.is_none();
    if !rebroadcast {
        let customer_id = repo.get_aggregate_order(current.aggregate_order_id)?.user_id;
        validate_request(&current, customer_id, OrderStatus::Offered, Actor::System)?;
    }

    let existing = repo.offers_for(sub_order_id)?;
    let offers: Vec<RiderOffer> = repo
        .eligible_riders()?
        .into_iter()
        .filter(|rider| {
            !existing.iter().any(|o| {
                o.rider_id == rider.id && (o.status == OfferStatus::Rejected || o.is_live(now))
            })
        })
        .map(|rider| new_offer(sub_order_id, rider.id, now, settings))
        .collect();
    repo.insert_offers(&offers)?;

    if !rebroadcast {
        let mut next = current.next_version(now);
        next.status = OrderStatus::Offered;
        repo.write_locked_sub_order(&next)?;
        let order = synchronize(repo, next.aggregate_order_id, now, outbox)?;
        outbox.status_updated(&order, &next, current.status);
    }
    for offer in &offers {
        outbox.rider_offered(offer, &current);
    }
    Ok(offers)
}

/// Assigns `offer`'s rider. The caller holds the sub-order row lock and has
/// already checked the offer itself.
fn claim_locked<R: Repository>(
    repo: &mut R,
    current: SubOrder,
    offer: &RiderOffer,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<SubOrder> {
    if current.rider_id.is_some() {
        return Err(OrchestrationError::offer_unavailable(
            offer.id,
            UnavailableReason::AlreadyTaken,
        ));
    }
    if !is_legal_edge(current.status, OrderStatus::Accepted, &current.fulfillment) {
        return Err(OrchestrationError::offer_unavailable(
            offer.id,
            UnavailableReason::NotAvailable,
        ));
    }
    let mut rider = repo.lock_rider(offer.rider_id)?;
    if !rider.online {
        return Err(OrchestrationError::AccessDenied(format!(
            "rider {} is offline",
            rider.id
        )));
    }
    if rider.status != RiderStatus::Idle {
        return Err(OrchestrationError::AccessDenied(format!(
            "rider {} is already on a delivery",
            rider.id
        )));
    }

    let mut next = current.next_version(now);
    next.rider_id = Some(rider.id);
    next.status = OrderStatus::Accepted;
    repo.write_locked_sub_order(&next)?;
    if !repo.transition_offer(offer.id, OfferStatus::Pending, OfferStatus::Accepted)? {
        return Err(OrchestrationError::offer_unavailable(
            offer.id,
            UnavailableReason::AlreadyResolved,
        ));
    }
    rider.status = RiderStatus::OnDelivery;
    rider.updated_at = now;
    repo.save_rider(&rider)?;

    let order = synchronize(repo, next.aggregate_order_id, now, outbox)?;
    outbox.status_updated(&order, &next, current.status);
    outbox.rider_assignment_changed(&order, &next, rider.id, true);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use chrono::Duration;

    use super::*;
    use crate::models::OrderingMode;
    use crate::testing::{delivery_sub_order, pending_order, Harness};

    fn confirmed_delivery(harness: &Harness) -> SubOrder {
        let order = pending_order(OrderingMode::Delivery);
        let sub_order = delivery_sub_order(&order, OrderStatus::Confirmed);
        harness.seed(&order, &[sub_order.clone()]);
        sub_order
    }

    fn unavailable(result: &Result<Acceptance>) -> Option<UnavailableReason> {
        match result {
            Err(OrchestrationError::OfferUnavailable { reason, .. }) => Some(*reason),
            _ => None,
        }
    }

    #[test]
    fn broadcast_offers_every_eligible_rider() {
        let harness = Harness::new();
        let riders: Vec<Rider> = (0..3).map(|_| harness.online_rider()).collect();
        let offline = harness.dispatcher().register_rider("offline").unwrap();
        let sub_order = confirmed_delivery(&harness);

        let offers = harness.dispatcher().broadcast(sub_order.id).unwrap();

        assert_eq!(offers.len(), riders.len());
        assert!(offers.iter().all(|o| o.status == OfferStatus::Pending));
        assert!(offers.iter().all(|o| o.rider_id != offline.id));
        assert!(offers
            .iter()
            .all(|o| o.expires_at == o.created_at + harness.settings.offer_ttl));
        assert_eq!(harness.sub_order(sub_order.id).status, OrderStatus::Offered);
        for rider in &riders {
            assert_eq!(harness.sink.kinds_for(rider.id), vec!["rider_offered"]);
        }
    }

    #[test]
    fn broadcast_refuses_non_delivery() {
        let harness = Harness::new();
        let order = pending_order(OrderingMode::Takeaway);
        let mut sub_order = delivery_sub_order(&order, OrderStatus::Confirmed);
        sub_order.fulfillment = crate::models::Fulfillment::Takeaway;
        harness.seed(&order, &[sub_order.clone()]);

        assert!(matches!(
            harness.dispatcher().broadcast(sub_order.id),
            Err(OrchestrationError::NotDispatchable { .. })
        ));
    }

    #[test]
    fn concurrent_accepts_bind_exactly_one_rider() {
        let harness = Arc::new(Harness::new());
        let riders: Vec<Rider> = (0..4).map(|_| harness.online_rider()).collect();
        let sub_order = confirmed_delivery(&harness);
        let offers = harness.dispatcher().broadcast(sub_order.id).unwrap();
        assert_eq!(offers.len(), riders.len());

        let barrier = Arc::new(Barrier::new(offers.len()));
        let handles: Vec<_> = offers
            .iter()
            .map(|offer| {
                let harness = harness.clone();
                let barrier = barrier.clone();
                let (offer_id, rider_id) = (offer.id, offer.rider_id);
                thread::spawn(move || {
                    barrier.wait();
                    harness.dispatcher().accept(offer_id, rider_id)
                })
            })
            .collect();
        let results: Vec<Result<Acceptance>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&Acceptance> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| unavailable(r) == Some(UnavailableReason::AlreadyTaken))
                .count(),
            offers.len() - 1
        );

        let bound = harness.sub_order(sub_order.id);
        assert_eq!(bound.status, OrderStatus::Accepted);
        assert_eq!(bound.rider_id, winners[0].sub_order.rider_id);
        let accepted = harness
            .dispatcher()
            .offers_for(sub_order.id)
            .unwrap()
            .into_iter()
            .filter(|o| o.status == OfferStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn two_riders_racing_one_wins() {
        let harness = Arc::new(Harness::new());
        for _ in 0..4 {
            harness.online_rider();
        }
        let sub_order = confirmed_delivery(&harness);
        let offers = harness.dispatcher().broadcast(sub_order.id).unwrap();
        let (b, c) = (offers[1].clone(), offers[2].clone());

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [b, c]
            .into_iter()
            .map(|offer| {
                let harness = harness.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (offer.rider_id, harness.dispatcher().accept(offer.id, offer.rider_id))
                })
            })
            .collect();
        let results: Vec<(Uuid, Result<Acceptance>)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winner: Vec<Uuid> = results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(rider, _)| *rider)
            .collect();
        assert_eq!(winner.len(), 1);
        assert!(results.iter().any(|(_, r)| unavailable(r).is_some()));
        assert_eq!(harness.sub_order(sub_order.id).rider_id, Some(winner[0]));
    }

    #[test]
    fn accepting_twice_is_a_no_op() {
        let harness = Harness::new();
        let rider = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let offer = harness.dispatcher().broadcast(sub_order.id).unwrap().remove(0);

        let first = harness.dispatcher().accept(offer.id, rider.id).unwrap();
        let second = harness.dispatcher().accept(offer.id, rider.id).unwrap();

        assert!(first.newly_assigned);
        assert!(!second.newly_assigned);
        assert_eq!(second.sub_order.version, first.sub_order.version);
        assert_eq!(harness.sub_order(sub_order.id).version, first.sub_order.version);
        assert_eq!(harness.rider(rider.id).status, RiderStatus::OnDelivery);
    }

    #[test]
    fn expired_offer_cannot_be_accepted() {
        let harness = Harness::new();
        let rider = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let offer = harness.dispatcher().broadcast(sub_order.id).unwrap().remove(0);
        harness.age_offers(sub_order.id, harness.settings.offer_ttl + Duration::minutes(1));

        let result = harness.dispatcher().accept(offer.id, rider.id);

        assert_eq!(unavailable(&result), Some(UnavailableReason::Expired));
        assert_eq!(harness.sub_order(sub_order.id).rider_id, None);
    }

    #[test]
    fn reject_only_touches_own_offer() {
        let harness = Harness::new();
        let alice = harness.online_rider();
        let bob = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let offers = harness.dispatcher().broadcast(sub_order.id).unwrap();
        let alice_offer = offers.iter().find(|o| o.rider_id == alice.id).unwrap();
        let bob_offer = offers.iter().find(|o| o.rider_id == bob.id).unwrap();

        assert!(matches!(
            harness.dispatcher().reject(alice_offer.id, bob.id),
            Err(OrchestrationError::AccessDenied(_))
        ));
        let rejected = harness.dispatcher().reject(alice_offer.id, alice.id).unwrap();
        assert_eq!(rejected.status, OfferStatus::Rejected);

        let stored = harness.dispatcher().offers_for(sub_order.id).unwrap();
        let bob_stored = stored.iter().find(|o| o.id == bob_offer.id).unwrap();
        assert_eq!(bob_stored.status, OfferStatus::Pending);
        assert_eq!(harness.sub_order(sub_order.id).status, OrderStatus::Offered);

        let again = harness.dispatcher().accept(alice_offer.id, alice.id);
        assert_eq!(unavailable(&again), Some(UnavailableReason::AlreadyResolved));
    }

    #[test]
    fn board_claim_goes_through_the_same_check() {
        let harness = Harness::new();
        let first = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        harness.dispatcher().broadcast(sub_order.id).unwrap();
        let latecomer = harness.online_rider();

        assert_eq!(
            harness
                .dispatcher()
                .available_orders(latecomer.id)
                .unwrap()
                .iter()
                .map(|s| s.id)
                .collect::<Vec<_>>(),
            vec![sub_order.id]
        );
        let claimed = harness
            .dispatcher()
            .accept_available(sub_order.id, latecomer.id)
            .unwrap();
        assert_eq!(claimed.sub_order.rider_id, Some(latecomer.id));

        let too_late = harness.dispatcher().accept_available(sub_order.id, first.id);
        assert_eq!(unavailable(&too_late), Some(UnavailableReason::AlreadyTaken));
        assert!(harness.dispatcher().available_orders(first.id).unwrap().is_empty());
    }

    #[test]
    fn release_reopens_sub_order_for_other_riders() {
        let harness = Harness::new();
        let alice = harness.online_rider();
        let bob = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let offers = harness.dispatcher().broadcast(sub_order.id).unwrap();
        let alice_offer = offers.iter().find(|o| o.rider_id == alice.id).unwrap();
        let bob_offer = offers.iter().find(|o| o.rider_id == bob.id).unwrap();
        harness.dispatcher().accept(alice_offer.id, alice.id).unwrap();

        assert!(matches!(
            harness.dispatcher().release(sub_order.id, bob.id),
            Err(OrchestrationError::AccessDenied(_))
        ));
        let released = harness.dispatcher().release(sub_order.id, alice.id).unwrap();
        assert_eq!(released.status, OrderStatus::Offered);
        assert_eq!(released.rider_id, None);
        assert_eq!(harness.rider(alice.id).status, RiderStatus::Idle);

        let taken = harness.dispatcher().accept(bob_offer.id, bob.id).unwrap();
        assert_eq!(taken.sub_order.rider_id, Some(bob.id));
        assert!(harness
            .sink
            .kinds_for(sub_order.vendor_id)
            .contains(&"rider_assignment_changed"));
    }

    #[test]
    fn sweep_rebroadcasts_when_all_offers_lapsed() {
        let harness = Harness::new();
        let rider = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let first = harness.dispatcher().broadcast(sub_order.id).unwrap();
        assert_eq!(harness.dispatcher().redispatch_expired().unwrap(), 0);

        harness.age_offers(sub_order.id, harness.settings.offer_ttl + Duration::minutes(1));
        assert_eq!(harness.dispatcher().redispatch_expired().unwrap(), 1);

        let offers = harness.dispatcher().offers_for(sub_order.id).unwrap();
        let old = offers.iter().find(|o| o.id == first[0].id).unwrap();
        assert_eq!(old.status, OfferStatus::Expired);
        let fresh: Vec<&RiderOffer> = offers.iter().filter(|o| o.is_live(Utc::now())).collect();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].rider_id, rider.id);
        assert!(harness.dispatcher().accept(fresh[0].id, rider.id).is_ok());
    }

    #[test]
    fn busy_rider_is_not_offered() {
        let harness = Harness::new();
        let idle = harness.online_rider();
        let busy = harness.on_delivery_rider();
        let sub_order = confirmed_delivery(&harness);

        let offers = harness.dispatcher().broadcast(sub_order.id).unwrap();
        let riders: Vec<Uuid> = offers.iter().map(|o| o.rider_id).collect();
        assert_eq!(riders, vec![idle.id]);
        assert!(harness.dispatcher().available_orders(busy.id).unwrap().is_empty());
    }

    #[test]
    fn one_rider_cannot_hold_two_sub_orders() {
        let harness = Arc::new(Harness::new());
        let rider = harness.online_rider();
        let first = confirmed_delivery(&harness);
        let second = confirmed_delivery(&harness);
        let offers: Vec<RiderOffer> = [first.id, second.id]
            .iter()
            .map(|id| harness.dispatcher().broadcast(*id).unwrap().remove(0))
            .collect();

        let barrier = Arc::new(Barrier::new(offers.len()));
        let handles: Vec<_> = offers
            .into_iter()
            .map(|offer| {
                let harness = harness.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (offer.sub_order_id, harness.dispatcher().accept(offer.id, rider.id))
                })
            })
            .collect();
        let results: Vec<(Uuid, Result<Acceptance>)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let won: Vec<Uuid> = results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(won.len(), 1);
        assert!(results
            .iter()
            .any(|(_, r)| matches!(r, Err(OrchestrationError::AccessDenied(_)))));

        let lost = if won[0] == first.id { second.id } else { first.id };
        assert_eq!(harness.sub_order(won[0]).rider_id, Some(rider.id));
        assert_eq!(harness.sub_order(lost).rider_id, None);
        assert_eq!(harness.sub_order(lost).status, OrderStatus::Offered);
        assert_eq!(harness.rider(rider.id).status, RiderStatus::OnDelivery);
    }

    #[test]
    fn sweep_offers_confirmed_sub_orders_never_broadcast() {
        let harness = Harness::new();
        let rider = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);

        assert_eq!(harness.dispatcher().redispatch_expired().unwrap(), 1);

        assert_eq!(harness.sub_order(sub_order.id).status, OrderStatus::Offered);
        let offers = harness.dispatcher().offers_for(sub_order.id).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].rider_id, rider.id);
        let board: Vec<Uuid> = harness
            .dispatcher()
            .available_orders(rider.id)
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(board, vec![sub_order.id]);
        assert_eq!(harness.dispatcher().redispatch_expired().unwrap(), 0);
    }

    #[test]
    fn offline_rider_cannot_claim() {
        let harness = Harness::new();
        let rider = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let offer = harness.dispatcher().broadcast(sub_order.id).unwrap().remove(0);
        harness.dispatcher().set_availability(rider.id, false, None).unwrap();

        assert!(matches!(
            harness.dispatcher().accept(offer.id, rider.id),
            Err(OrchestrationError::AccessDenied(_))
        ));
        assert!(matches!(
            harness.dispatcher().accept_available(sub_order.id, rider.id),
            Err(OrchestrationError::AccessDenied(_))
        ));
        let stored = harness.sub_order(sub_order.id);
        assert_eq!(stored.rider_id, None);
        assert_eq!(stored.status, OrderStatus::Offered);
        assert_eq!(harness.rider(rider.id).status, RiderStatus::Idle);
    }

    #[test]
    fn declined_rider_cannot_claim_from_board() {
        let harness = Harness::new();
        let rider = harness.online_rider();
        let sub_order = confirmed_delivery(&harness);
        let offer = harness.dispatcher().broadcast(sub_order.id).unwrap().remove(0);
        harness.dispatcher().reject(offer.id, rider.id).unwrap();

        let result = harness.dispatcher().accept_available(sub_order.id, rider.id);

        assert_eq!(unavailable(&result), Some(UnavailableReason::AlreadyResolved));
        assert_eq!(harness.sub_order(sub_order.id).rider_id, None);
        assert_eq!(harness.dispatcher().offers_for(sub_order.id).unwrap().len(), 1);
    }
}
