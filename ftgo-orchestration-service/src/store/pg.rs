use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::dsl::{delete, insert_into, update};
use diesel::prelude::*;
use diesel::{Connection, PgConnection};
use diesel_migrations::MigrationHarness;
use uuid::Uuid;

use super::{Repository, Store, StoreError};
use crate::models::{
    AggregateOrder, Fulfillment, OfferStatus, OrderStatus, OrderType, PendingCheckout,
    ReservationSlot, Rider, RiderOffer, RiderStatus, SubOrder, SubOrderLineItem,
};
use crate::schema::{
    aggregate_orders, pending_checkouts, reservation_slots, rider_offers, riders,
    sub_order_line_items, sub_orders,
};

/// Postgres-backed store. Every transaction runs on its own connection, so
/// row locks and conditional updates are arbitrated by the database.
pub struct PgStore {
    database_url: String,
}

impl PgStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    pub fn connect(&self) -> Result<PgConnection, StoreError> {
        Ok(PgConnection::establish(&self.database_url)?)
    }

    /// Applies pending migrations and returns the versions that ran.
    pub fn run_migrations(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect()?;
        let applied = conn
            .run_pending_migrations(crate::MIGRATIONS)
            .map_err(|err| StoreError::Migration(err.to_string()))?;
        Ok(applied.iter().map(|version| version.to_string()).collect())
    }
}

enum TxError<E> {
    Aborted(E),
    Store(StoreError),
}

impl<E> From<diesel::result::Error> for TxError<E> {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Store(err.into())
    }
}

impl Store for PgStore {
    type Repo = PgConnection;

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.connect()?;
        conn.transaction::<T, TxError<E>, _>(|conn| f(conn).map_err(TxError::Aborted))
            .map_err(|err| match err {
                TxError::Aborted(err) => err,
                TxError::Store(err) => E::from(err),
            })
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = sub_orders)]
#[diesel(treat_none_as_null = true)]
struct SubOrderRecord {
    id: Uuid,
    aggregate_order_id: Uuid,
    vendor_id: Uuid,
    position: i32,
    rider_id: Option<Uuid>,
    reservation_slot_id: Option<Uuid>,
    table_ref: Option<String>,
    status: OrderStatus,
    order_type: OrderType,
    total_amount: BigDecimal,
    version: i64,
    preparation_start_time: Option<DateTime<Utc>>,
    estimated_delivery_time: Option<DateTime<Utc>>,
    actual_delivery_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&SubOrder> for SubOrderRecord {
    fn from(s: &SubOrder) -> Self {
        SubOrderRecord {
            id: s.id,
            aggregate_order_id: s.aggregate_order_id,
            vendor_id: s.vendor_id,
            position: s.position,
            rider_id: s.rider_id,
            reservation_slot_id: s.fulfillment.slot_id(),
            table_ref: s.fulfillment.table_ref().map(str::to_string),
            status: s.status,
            order_type: s.fulfillment.order_type(),
            total_amount: s.total_amount.clone(),
            version: s.version,
            preparation_start_time: s.preparation_start_time,
            estimated_delivery_time: s.estimated_delivery_time,
            actual_delivery_time: s.actual_delivery_time,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

impl TryFrom<SubOrderRecord> for SubOrder {
    type Error = StoreError;

    fn try_from(r: SubOrderRecord) -> Result<Self, Self::Error> {
        let fulfillment = Fulfillment::from_columns(r.order_type, r.reservation_slot_id, r.table_ref)
            .map_err(|reason| StoreError::Corrupt(format!("sub_order {}: {}", r.id, reason)))?;
        Ok(SubOrder {
            id: r.id,
            aggregate_order_id: r.aggregate_order_id,
            vendor_id: r.vendor_id,
            position: r.position,
            rider_id: r.rider_id,
            fulfillment,
            status: r.status,
            total_amount: r.total_amount,
            version: r.version,
            preparation_start_time: r.preparation_start_time,
            estimated_delivery_time: r.estimated_delivery_time,
            actual_delivery_time: r.actual_delivery_time,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn into_sub_orders(records: Vec<SubOrderRecord>) -> Result<Vec<SubOrder>, StoreError> {
    records.into_iter().map(SubOrder::try_from).collect()
}

impl Repository for PgConnection {
    fn insert_aggregate_order(&mut self, order: &AggregateOrder) -> Result<(), StoreError> {
        insert_into(aggregate_orders::table)
            .values(order)
            .execute(self)?;
        Ok(())
    }

    fn get_aggregate_order(&mut self, id: Uuid) -> Result<AggregateOrder, StoreError> {
        aggregate_orders::table
            .find(id)
            .select(AggregateOrder::as_select())
            .first(self)
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "aggregate order",
                id,
            })
    }

    fn lock_aggregate_order(&mut self, id: Uuid) -> Result<AggregateOrder, StoreError> {
        aggregate_orders::table
            .find(id)
            .select(AggregateOrder::as_select())
            .for_update()
            .first(self)
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "aggregate order",
                id,
            })
    }

    fn save_aggregate_order(&mut self, order: &AggregateOrder) -> Result<(), StoreError> {
        update(aggregate_orders::table.find(order.id))
            .set((
                aggregate_orders::status.eq(order.status),
                aggregate_orders::payment_status.eq(order.payment_status),
                aggregate_orders::updated_at.eq(order.updated_at),
            ))
            .execute(self)?;
        Ok(())
    }

    fn insert_sub_order(
        &mut self,
        sub_order: &SubOrder,
        line_items: &[SubOrderLineItem],
    ) -> Result<(), StoreError> {
        insert_into(sub_orders::table)
            .values(&SubOrderRecord::from(sub_order))
            .execute(self)?;
        if !line_items.is_empty() {
            insert_into(sub_order_line_items::table)
                .values(line_items)
                .execute(self)?;
        }
        Ok(())
    }

    fn get_sub_order(&mut self, id: Uuid) -> Result<SubOrder, StoreError> {
        sub_orders::table
            .find(id)
            .select(SubOrderRecord::as_select())
            .first::<SubOrderRecord>(self)
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "sub-order",
                id,
            })?
            .try_into()
    }

    fn sub_orders_of(&mut self, aggregate_order_id: Uuid) -> Result<Vec<SubOrder>, StoreError> {
        let records = sub_orders::table
            .filter(sub_orders::aggregate_order_id.eq(aggregate_order_id))
            .order(sub_orders::position.asc())
            .select(SubOrderRecord::as_select())
            .load::<SubOrderRecord>(self)?;
        into_sub_orders(records)
    }

    fn line_items_of(&mut self, sub_order_id: Uuid) -> Result<Vec<SubOrderLineItem>, StoreError> {
        Ok(sub_order_line_items::table
            .filter(sub_order_line_items::sub_order_id.eq(sub_order_id))
            .order(sub_order_line_items::position.asc())
            .select(SubOrderLineItem::as_select())
            .load(self)?)
    }

    fn compare_and_swap_sub_order(
        &mut self,
        expected_version: i64,
        next: &SubOrder,
    ) -> Result<bool, StoreError> {
        let updated = update(
            sub_orders::table
                .find(next.id)
                .filter(sub_orders::version.eq(expected_version)),
        )
        .set(&SubOrderRecord::from(next))
        .execute(self)?;
        Ok(updated == 1)
    }

    fn lock_sub_order(&mut self, id: Uuid) -> Result<SubOrder, StoreError> {
        sub_orders::table
            .find(id)
            .select(SubOrderRecord::as_select())
            .for_update()
            .first::<SubOrderRecord>(self)
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "sub-order",
                id,
            })?
            .try_into()
    }

    fn write_locked_sub_order(&mut self, next: &SubOrder) -> Result<(), StoreError> {
        let updated = update(sub_orders::table.find(next.id))
            .set(&SubOrderRecord::from(next))
            .execute(self)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "sub-order",
                id: next.id,
            });
        }
        Ok(())
    }

    fn unclaimed_sub_orders(&mut self) -> Result<Vec<SubOrder>, StoreError> {
        let records = sub_orders::table
            .filter(sub_orders::status.eq(OrderStatus::Offered))
            .filter(sub_orders::rider_id.is_null())
            .filter(sub_orders::order_type.eq(OrderType::Delivery))
            .order(sub_orders::created_at.asc())
            .select(SubOrderRecord::as_select())
            .load::<SubOrderRecord>(self)?;
        into_sub_orders(records)
    }

    fn undispatched_sub_orders(&mut self) -> Result<Vec<SubOrder>, StoreError> {
        let records = sub_orders::table
            .filter(sub_orders::status.eq(OrderStatus::Confirmed))
            .filter(sub_orders::rider_id.is_null())
            .filter(sub_orders::order_type.eq(OrderType::Delivery))
            .order(sub_orders::created_at.asc())
            .select(SubOrderRecord::as_select())
            .load::<SubOrderRecord>(self)?;
        into_sub_orders(records)
    }

    fn insert_slot(&mut self, slot: &ReservationSlot) -> Result<(), StoreError> {
        insert_into(reservation_slots::table)
            .values(slot)
            .execute(self)?;
        Ok(())
    }

    fn get_slot(&mut self, id: Uuid) -> Result<ReservationSlot, StoreError> {
        reservation_slots::table
            .find(id)
            .select(ReservationSlot::as_select())
            .first(self)
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "reservation slot",
                id,
            })
    }

    fn try_increment_slot(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let updated = update(
            reservation_slots::table
                .find(id)
                .filter(reservation_slots::is_active.eq(true))
                .filter(reservation_slots::current_capacity.lt(reservation_slots::max_capacity)),
        )
        .set((
            reservation_slots::current_capacity.eq(reservation_slots::current_capacity + 1),
            reservation_slots::version.eq(reservation_slots::version + 1),
        ))
        .execute(self)?;
        Ok(updated == 1)
    }

    fn try_decrement_slot(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let updated = update(
            reservation_slots::table
                .find(id)
                .filter(reservation_slots::current_capacity.gt(0)),
        )
        .set((
            reservation_slots::current_capacity.eq(reservation_slots::current_capacity - 1),
            reservation_slots::version.eq(reservation_slots::version + 1),
        ))
        .execute(self)?;
        Ok(updated == 1)
    }

    fn set_slot_active(&mut self, id: Uuid, active: bool) -> Result<bool, StoreError> {
        let updated = update(reservation_slots::table.find(id))
            .set((
                reservation_slots::is_active.eq(active),
                reservation_slots::version.eq(reservation_slots::version + 1),
            ))
            .execute(self)?;
        Ok(updated == 1)
    }

    fn insert_rider(&mut self, rider: &Rider) -> Result<(), StoreError> {
        insert_into(riders::table).values(rider).execute(self)?;
        Ok(())
    }

    fn get_rider(&mut self, id: Uuid) -> Result<Rider, StoreError> {
        riders::table
            .find(id)
            .select(Rider::as_select())
            .first(self)
            .optional()?
            .ok_or(StoreError::NotFound { entity: "rider", id })
    }

    fn lock_rider(&mut self, id: Uuid) -> Result<Rider, StoreError> {
        riders::table
            .find(id)
            .select(Rider::as_select())
            .for_update()
            .first(self)
            .optional()?
            .ok_or(StoreError::NotFound { entity: "rider", id })
    }

    fn save_rider(&mut self, rider: &Rider) -> Result<(), StoreError> {
        update(riders::table.find(rider.id))
            .set((
                riders::online.eq(rider.online),
                riders::latitude.eq(rider.latitude),
                riders::longitude.eq(rider.longitude),
                riders::status.eq(rider.status),
                riders::updated_at.eq(rider.updated_at),
            ))
            .execute(self)?;
        Ok(())
    }

    fn eligible_riders(&mut self) -> Result<Vec<Rider>, StoreError> {
        Ok(riders::table
            .filter(riders::online.eq(true))
            .filter(riders::status.eq(RiderStatus::Idle))
            .order(riders::updated_at.asc())
            .select(Rider::as_select())
            .load(self)?)
    }

    fn insert_offers(&mut self, offers: &[RiderOffer]) -> Result<(), StoreError> {
        if !offers.is_empty() {
            insert_into(rider_offers::table)
                .values(offers)
                .execute(self)?;
        }
        Ok(())
    }

    fn get_offer(&mut self, id: Uuid) -> Result<RiderOffer, StoreError> {
        rider_offers::table
            .find(id)
            .select(RiderOffer::as_select())
            .first(self)
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "rider offer",
                id,
            })
    }

    fn offers_for(&mut self, sub_order_id: Uuid) -> Result<Vec<RiderOffer>, StoreError> {
        Ok(rider_offers::table
            .filter(rider_offers::sub_order_id.eq(sub_order_id))
            .order(rider_offers::created_at.asc())
            .select(RiderOffer::as_select())
            .load(self)?)
    }

    fn transition_offer(
        &mut self,
        id: Uuid,
        from: OfferStatus,
        to: OfferStatus,
    ) -> Result<bool, StoreError> {
        let updated = update(
            rider_offers::table
                .find(id)
                .filter(rider_offers::status.eq(from)),
        )
        .set(rider_offers::status.eq(to))
        .execute(self)?;
        Ok(updated == 1)
    }

    fn insert_checkout(&mut self, checkout: &PendingCheckout) -> Result<(), StoreError> {
        insert_into(pending_checkouts::table)
            .values(checkout)
            .execute(self)?;
        Ok(())
    }

    fn take_checkout(&mut self, token: &str) -> Result<Option<PendingCheckout>, StoreError> {
        Ok(delete(pending_checkouts::table.find(token))
            .returning(PendingCheckout::as_returning())
            .get_result(self)
            .optional()?)
    }

    fn purge_checkouts(&mut self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(
            delete(pending_checkouts::table.filter(pending_checkouts::expires_at.le(now)))
                .execute(self)?,
        )
    }
}
