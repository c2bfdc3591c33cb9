//! Capacity reservation ledger.
//!
//! A slot's counter only ever moves through [`Repository::try_increment_slot`]
//! and [`Repository::try_decrement_slot`], each a single conditional write
//! evaluated by the store. There is no lock spanning several slots.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{log_failure, OrchestrationError, Result};
use crate::models::ReservationSlot;
use crate::store::{Repository, Store};

pub struct CapacityLedger<S> {
    store: Arc<S>,
}

impl<S: Store> CapacityLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Takes one unit of capacity. `Ok(false)` means the slot is full or
    /// inactive; nothing changed.
    #[instrument(skip(self))]
    pub fn reserve(&self, slot_id: Uuid) -> Result<bool> {
        self.store
            .transaction(|repo| reserve_in(repo, slot_id))
            .map_err(|err| log_failure("reserve", err))
    }

    /// Gives one unit back. `Ok(false)` means the counter was already zero.
    #[instrument(skip(self))]
    pub fn release(&self, slot_id: Uuid) -> Result<bool> {
        self.store
            .transaction(|repo| release_in(repo, slot_id))
            .map_err(|err| log_failure("release", err))
    }

    #[instrument(skip(self))]
    pub fn open_slot(
        &self,
        vendor_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        max_capacity: i32,
    ) -> Result<ReservationSlot> {
        if max_capacity < 1 {
            return Err(log_failure(
                "open_slot",
                OrchestrationError::InvalidRequest("max capacity must be at least 1".to_string()),
            ));
        }
        if end_time <= start_time {
            return Err(log_failure(
                "open_slot",
                OrchestrationError::InvalidRequest("slot must end after it starts".to_string()),
            ));
        }

        let slot = ReservationSlot {
            id: Uuid::new_v4(),
            vendor_id,
            start_time,
            end_time,
            max_capacity,
            current_capacity: 0,
            is_active: true,
            version: 0,
        };
        self.store
            .transaction(|repo| {
                repo.insert_slot(&slot)?;
                Ok(())
            })
            .map_err(|err| log_failure("open_slot", err))?;

        tracing::info!(slot_id = %slot.id, %vendor_id, max_capacity, "slot opened");
        Ok(slot)
    }

    #[instrument(skip(self))]
    pub fn set_slot_active(&self, slot_id: Uuid, active: bool) -> Result<ReservationSlot> {
        self.store
            .transaction(|repo| {
                if !repo.set_slot_active(slot_id, active)? {
                    return Err(OrchestrationError::NotFound {
                        entity: "reservation slot",
                        id: slot_id,
                    });
                }
                Ok(repo.get_slot(slot_id)?)
            })
            .map_err(|err| log_failure("set_slot_active", err))
    }

    pub fn get_slot(&self, slot_id: Uuid) -> Result<ReservationSlot> {
        self.store
            .transaction(|repo| Ok(repo.get_slot(slot_id)?))
            .map_err(|err| log_failure("get_slot", err))
    }
}

pub(crate) fn reserve_in<R: Repository>(repo: &mut R, slot_id: Uuid) -> Result<bool> {
    if repo.try_increment_slot(slot_id)? {
        return Ok(true);
    }
    // Distinguish a full slot from a missing one.
    repo.get_slot(slot_id)?;
    Ok(false)
}

pub(crate) fn release_in<R: Repository>(repo: &mut R, slot_id: Uuid) -> Result<bool> {
    if repo.try_decrement_slot(slot_id)? {
        return Ok(true);
    }
    repo.get_slot(slot_id)?;
    Ok(false)
}
