use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Repository, Store, StoreError};
use crate::models::{
    AggregateOrder, OfferStatus, OrderStatus, PendingCheckout, ReservationSlot, Rider,
    RiderOffer, SubOrder, SubOrderLineItem,
};

/// In-process store for tests and local runs.
///
/// Transactions are serialised behind one mutex and operate on a copy of the
/// state, so an `Err` from the closure leaves nothing behind. The row-level
/// locks of the Postgres backend are therefore implied by the mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Clone, Default)]
pub struct MemoryState {
    aggregate_orders: HashMap<Uuid, AggregateOrder>,
    sub_orders: HashMap<Uuid, SubOrder>,
    line_items: Vec<SubOrderLineItem>,
    slots: HashMap<Uuid, ReservationSlot>,
    riders: HashMap<Uuid, Rider>,
    offers: HashMap<Uuid, RiderOffer>,
    checkouts: HashMap<String, PendingCheckout>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    type Repo = MemoryState;

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut MemoryState) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = state.clone();
        let value = f(&mut working)?;
        *state = working;
        Ok(value)
    }
}

#[cfg(test)]
impl MemoryState {
    pub(crate) fn offers_mut(&mut self) -> impl Iterator<Item = &mut RiderOffer> {
        self.offers.values_mut()
    }

    /// Number of aggregate orders and sub-orders held.
    pub(crate) fn counts(&self) -> (usize, usize) {
        (self.aggregate_orders.len(), self.sub_orders.len())
    }
}

impl MemoryState {
    fn unbound_deliveries(&self, status: OrderStatus) -> Vec<SubOrder> {
        let mut sub_orders: Vec<SubOrder> = self
            .sub_orders
            .values()
            .filter(|s| {
                s.status == status && s.rider_id.is_none() && s.fulfillment.is_dispatchable()
            })
            .cloned()
            .collect();
        sub_orders.sort_by_key(|s| (s.created_at, s.position));
        sub_orders
    }
}

fn duplicate(entity: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("duplicate {} {}", entity, id))
}

impl Repository for MemoryState {
    fn insert_aggregate_order(&mut self, order: &AggregateOrder) -> Result<(), StoreError> {
        if self.aggregate_orders.contains_key(&order.id) {
            return Err(duplicate("aggregate order", order.id));
        }
        self.aggregate_orders.insert(order.id, order.clone());
        Ok(())
    }

    fn get_aggregate_order(&mut self, id: Uuid) -> Result<AggregateOrder, StoreError> {
        self.aggregate_orders
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "aggregate order",
                id,
            })
    }

    fn lock_aggregate_order(&mut self, id: Uuid) -> Result<AggregateOrder, StoreError> {
        self.get_aggregate_order(id)
    }

    fn save_aggregate_order(&mut self, order: &AggregateOrder) -> Result<(), StoreError> {
        let stored = self
            .aggregate_orders
            .get_mut(&order.id)
            .ok_or(StoreError::NotFound {
                entity: "aggregate order",
                id: order.id,
            })?;
        stored.status = order.status;
        stored.payment_status = order.payment_status;
        stored.updated_at = order.updated_at;
        Ok(())
    }

    fn insert_sub_order(
        &mut self,
        sub_order: &SubOrder,
        line_items: &[SubOrderLineItem],
    ) -> Result<(), StoreError> {
        if !self.aggregate_orders.contains_key(&sub_order.aggregate_order_id) {
            return Err(StoreError::NotFound {
                entity: "aggregate order",
                id: sub_order.aggregate_order_id,
            });
        }
        if self.sub_orders.contains_key(&sub_order.id) {
            return Err(duplicate("sub-order", sub_order.id));
        }
        self.sub_orders.insert(sub_order.id, sub_order.clone());
        self.line_items.extend_from_slice(line_items);
        Ok(())
    }

    fn get_sub_order(&mut self, id: Uuid) -> Result<SubOrder, StoreError> {
        self.sub_orders.get(&id).cloned().ok_or(StoreError::NotFound {
            entity: "sub-order",
            id,
        })
    }

    fn sub_orders_of(&mut self, aggregate_order_id: Uuid) -> Result<Vec<SubOrder>, StoreError> {
        let mut sub_orders: Vec<SubOrder> = self
            .sub_orders
            .values()
            .filter(|s| s.aggregate_order_id == aggregate_order_id)
            .cloned()
            .collect();
        sub_orders.sort_by_key(|s| s.position);
        Ok(sub_orders)
    }

    fn line_items_of(&mut self, sub_order_id: Uuid) -> Result<Vec<SubOrderLineItem>, StoreError> {
        let mut items: Vec<SubOrderLineItem> = self
            .line_items
            .iter()
            .filter(|item| item.sub_order_id == sub_order_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.position);
        Ok(items)
    }

    fn compare_and_swap_sub_order(
        &mut self,
        expected_version: i64,
        next: &SubOrder,
    ) -> Result<bool, StoreError> {
        match self.sub_orders.get_mut(&next.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lock_sub_order(&mut self, id: Uuid) -> Result<SubOrder, StoreError> {
        self.get_sub_order(id)
    }

    fn write_locked_sub_order(&mut self, next: &SubOrder) -> Result<(), StoreError> {
        let stored = self
            .sub_orders
            .get_mut(&next.id)
            .ok_or(StoreError::NotFound {
                entity: "sub-order",
                id: next.id,
            })?;
        *stored = next.clone();
        Ok(())
    }

    fn unclaimed_sub_orders(&mut self) -> Result<Vec<SubOrder>, StoreError> {
        Ok(self.unbound_deliveries(OrderStatus::Offered))
    }

    fn undispatched_sub_orders(&mut self) -> Result<Vec<SubOrder>, StoreError> {
        Ok(self.unbound_deliveries(OrderStatus::Confirmed))
    }

    fn insert_slot(&mut self, slot: &ReservationSlot) -> Result<(), StoreError> {
        if self.slots.contains_key(&slot.id) {
            return Err(duplicate("reservation slot", slot.id));
        }
        self.slots.insert(slot.id, slot.clone());
        Ok(())
    }

    fn get_slot(&mut self, id: Uuid) -> Result<ReservationSlot, StoreError> {
        self.slots.get(&id).cloned().ok_or(StoreError::NotFound {
            entity: "reservation slot",
            id,
        })
    }

    fn try_increment_slot(&mut self, id: Uuid) -> Result<bool, StoreError> {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.is_active && slot.current_capacity < slot.max_capacity => {
                slot.current_capacity += 1;
                slot.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn try_decrement_slot(&mut self, id: Uuid) -> Result<bool, StoreError> {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.current_capacity > 0 => {
                slot.current_capacity -= 1;
                slot.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_slot_active(&mut self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.is_active = active;
                slot.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert_rider(&mut self, rider: &Rider) -> Result<(), StoreError> {
        if self.riders.contains_key(&rider.id) {
            return Err(duplicate("rider", rider.id));
        }
        self.riders.insert(rider.id, rider.clone());
        Ok(())
    }

    fn get_rider(&mut self, id: Uuid) -> Result<Rider, StoreError> {
        self.riders
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "rider", id })
    }

    fn lock_rider(&mut self, id: Uuid) -> Result<Rider, StoreError> {
        self.get_rider(id)
    }

    fn save_rider(&mut self, rider: &Rider) -> Result<(), StoreError> {
        let stored = self.riders.get_mut(&rider.id).ok_or(StoreError::NotFound {
            entity: "rider",
            id: rider.id,
        })?;
        *stored = rider.clone();
        Ok(())
    }

    fn eligible_riders(&mut self) -> Result<Vec<Rider>, StoreError> {
        let mut riders: Vec<Rider> = self
            .riders
            .values()
            .filter(|r| r.is_eligible())
            .cloned()
            .collect();
        riders.sort_by_key(|r| (r.updated_at, r.id));
        Ok(riders)
    }

    fn insert_offers(&mut self, offers: &[RiderOffer]) -> Result<(), StoreError> {
        for offer in offers {
            if self.offers.contains_key(&offer.id) {
                return Err(duplicate("rider offer", offer.id));
            }
            self.offers.insert(offer.id, offer.clone());
        }
        Ok(())
    }

    fn get_offer(&mut self, id: Uuid) -> Result<RiderOffer, StoreError> {
        self.offers.get(&id).cloned().ok_or(StoreError::NotFound {
            entity: "rider offer",
            id,
        })
    }

    fn offers_for(&mut self, sub_order_id: Uuid) -> Result<Vec<RiderOffer>, StoreError> {
        let mut offers: Vec<RiderOffer> = self
            .offers
            .values()
            .filter(|o| o.sub_order_id == sub_order_id)
            .cloned()
            .collect();
        offers.sort_by_key(|o| (o.created_at, o.id));
        Ok(offers)
    }

    fn transition_offer(
        &mut self,
        id: Uuid,
        from: OfferStatus,
        to: OfferStatus,
    ) -> Result<bool, StoreError> {
        let Some(sub_order_id) = self.offers.get(&id).map(|o| o.sub_order_id) else {
            return Ok(false);
        };
        // Mirrors the partial unique index on accepted offers.
        if to == OfferStatus::Accepted
            && self.offers.values().any(|o| {
                o.id != id && o.sub_order_id == sub_order_id && o.status == OfferStatus::Accepted
            })
        {
            return Err(duplicate("accepted offer for sub-order", sub_order_id));
        }
        match self.offers.get_mut(&id) {
            Some(offer) if offer.status == from => {
                offer.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn insert_checkout(&mut self, checkout: &PendingCheckout) -> Result<(), StoreError> {
        if self.checkouts.contains_key(&checkout.token) {
            return Err(StoreError::Corrupt("duplicate checkout token".to_string()));
        }
        self.checkouts
            .insert(checkout.token.clone(), checkout.clone());
        Ok(())
    }

    fn take_checkout(&mut self, token: &str) -> Result<Option<PendingCheckout>, StoreError> {
        Ok(self.checkouts.remove(token))
    }

    fn purge_checkouts(&mut self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.checkouts.len();
        self.checkouts.retain(|_, checkout| checkout.expires_at > now);
        Ok(before - self.checkouts.len())
    }
}
