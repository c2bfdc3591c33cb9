//! Persistence seam.
//!
//! [`Repository`] lists the row-level operations the orchestration core needs;
//! [`Store::transaction`] runs a closure against a repository atomically. A
//! sub-order row has two separate write paths:
//!
//! - optimistic: [`Repository::compare_and_swap_sub_order`] writes only if the
//!   stored version still equals the version that was read;
//! - pessimistic: [`Repository::lock_sub_order`] takes an exclusive row lock for
//!   the rest of the transaction, after which
//!   [`Repository::write_locked_sub_order`] writes unconditionally.
//!
//! Both paths bump the version, so each one notices writes made by the other.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AggregateOrder, OfferStatus, PendingCheckout, ReservationSlot, Rider, RiderOffer, SubOrder,
    SubOrderLineItem,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Cannot connect to database")]
    Connection(#[from] diesel::result::ConnectionError),
    #[error("Database error")]
    Database(#[source] diesel::result::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        StoreError::Database(err)
    }
}

pub trait Repository {
    fn insert_aggregate_order(&mut self, order: &AggregateOrder) -> Result<(), StoreError>;
    fn get_aggregate_order(&mut self, id: Uuid) -> Result<AggregateOrder, StoreError>;
    /// Reads the aggregate order and holds its row lock until commit.
    fn lock_aggregate_order(&mut self, id: Uuid) -> Result<AggregateOrder, StoreError>;
    /// Persists status, payment status and `updated_at` of a locked aggregate order.
    fn save_aggregate_order(&mut self, order: &AggregateOrder) -> Result<(), StoreError>;

    fn insert_sub_order(
        &mut self,
        sub_order: &SubOrder,
        line_items: &[SubOrderLineItem],
    ) -> Result<(), StoreError>;
    fn get_sub_order(&mut self, id: Uuid) -> Result<SubOrder, StoreError>;
    fn sub_orders_of(&mut self, aggregate_order_id: Uuid) -> Result<Vec<SubOrder>, StoreError>;
    fn line_items_of(&mut self, sub_order_id: Uuid) -> Result<Vec<SubOrderLineItem>, StoreError>;
    /// Writes `next` only if the stored row is still at `expected_version`.
    /// Returns `false` when another writer got there first.
    fn compare_and_swap_sub_order(
        &mut self,
        expected_version: i64,
        next: &SubOrder,
    ) -> Result<bool, StoreError>;
    /// Reads the sub-order and holds its row lock until commit.
    fn lock_sub_order(&mut self, id: Uuid) -> Result<SubOrder, StoreError>;
    /// Writes a sub-order whose row lock this transaction holds.
    fn write_locked_sub_order(&mut self, next: &SubOrder) -> Result<(), StoreError>;
    /// Delivery sub-orders in `OFFERED` with no rider bound, oldest first.
    fn unclaimed_sub_orders(&mut self) -> Result<Vec<SubOrder>, StoreError>;
    /// Delivery sub-orders still `CONFIRMED`, never broadcast, oldest first.
    fn undispatched_sub_orders(&mut self) -> Result<Vec<SubOrder>, StoreError>;

    fn insert_slot(&mut self, slot: &ReservationSlot) -> Result<(), StoreError>;
    fn get_slot(&mut self, id: Uuid) -> Result<ReservationSlot, StoreError>;
    /// Single conditional increment: succeeds only while the slot is active
    /// and `current_capacity < max_capacity`.
    fn try_increment_slot(&mut self, id: Uuid) -> Result<bool, StoreError>;
    /// Single conditional decrement: succeeds only while `current_capacity > 0`.
    fn try_decrement_slot(&mut self, id: Uuid) -> Result<bool, StoreError>;
    fn set_slot_active(&mut self, id: Uuid, active: bool) -> Result<bool, StoreError>;

    fn insert_rider(&mut self, rider: &Rider) -> Result<(), StoreError>;
    fn get_rider(&mut self, id: Uuid) -> Result<Rider, StoreError>;
    /// Reads the rider and holds its row lock until commit. Taken after any
    /// sub-order lock and before the aggregate order lock.
    fn lock_rider(&mut self, id: Uuid) -> Result<Rider, StoreError>;
    fn save_rider(&mut self, rider: &Rider) -> Result<(), StoreError>;
    /// Online riders with no delivery in hand.
    fn eligible_riders(&mut self) -> Result<Vec<Rider>, StoreError>;

    fn insert_offers(&mut self, offers: &[RiderOffer]) -> Result<(), StoreError>;
    fn get_offer(&mut self, id: Uuid) -> Result<RiderOffer, StoreError>;
    fn offers_for(&mut self, sub_order_id: Uuid) -> Result<Vec<RiderOffer>, StoreError>;
    /// Moves an offer from `from` to `to`; returns `false` if it was no longer in `from`.
    fn transition_offer(
        &mut self,
        id: Uuid,
        from: OfferStatus,
        to: OfferStatus,
    ) -> Result<bool, StoreError>;

    fn insert_checkout(&mut self, checkout: &PendingCheckout) -> Result<(), StoreError>;
    /// Removes and returns the checkout, if present.
    fn take_checkout(&mut self, token: &str) -> Result<Option<PendingCheckout>, StoreError>;
    fn purge_checkouts(&mut self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub trait Store: Send + Sync {
    type Repo: Repository;

    /// Runs `f` in one transaction; nothing it wrote survives unless it returns `Ok`.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Repo) -> Result<T, E>,
        E: From<StoreError>;
}
