//! Slot capacity accounting
//!
//! `reserved_count` is only ever changed here, and only through the store's
//! single conditional writes. Each successful reserve creates a hold keyed by
//! the returned handle; releasing flips that hold exactly once, and only the
//! flipping call gives the unit back. No notifications originate here.

use crate::{
    metrics::Metrics,
    store::Store,
    types::{AvailabilitySlot, NewSlot, ReservationHandle},
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns capacity accounting for availability slots
#[derive(Clone)]
pub struct SlotLedger {
    store: Arc<dyn Store>,
    metrics: Metrics,
}

impl SlotLedger {
    /// Create new slot ledger
    pub fn new(store: Arc<dyn Store>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Publish a new availability slot for a mentor
    pub fn create_slot(&self, mentor_id: Uuid, new_slot: NewSlot) -> Result<AvailabilitySlot> {
        if new_slot.end <= new_slot.start {
            return Err(Error::Validation("Slot end must be after start".to_string()));
        }
        if new_slot.capacity == 0 {
            return Err(Error::Validation("Slot capacity must be at least 1".to_string()));
        }
        if new_slot.price < Decimal::ZERO {
            return Err(Error::Validation("Slot price must not be negative".to_string()));
        }

        let slot = AvailabilitySlot {
            slot_id: Uuid::now_v7(),
            mentor_id,
            start: new_slot.start,
            end: new_slot.end,
            capacity: new_slot.capacity,
            reserved_count: 0,
            price: new_slot.price,
            session_type: new_slot.session_type,
            active: true,
            created_at: Utc::now(),
        };

        self.store.insert_slot(slot.clone())?;

        info!(
            slot_id = %slot.slot_id,
            %mentor_id,
            capacity = slot.capacity,
            "Slot created"
        );
        Ok(slot)
    }

    /// Get slot by ID
    pub fn slot(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        self.store.get_slot(slot_id)
    }

    /// All slots of a mentor
    pub fn slots_for_mentor(&self, mentor_id: Uuid) -> Result<Vec<AvailabilitySlot>> {
        self.store.slots_for_mentor(mentor_id)
    }

    /// Atomically take one unit of capacity
    pub fn reserve(&self, slot_id: Uuid) -> Result<ReservationHandle> {
        let slot = match self.store.reserve_unit(slot_id) {
            Ok(slot) => slot,
            Err(e) => {
                self.metrics.record_reservation(e.kind());
                debug!(%slot_id, "Reserve rejected: {}", e);
                return Err(e);
            }
        };

        let handle = ReservationHandle {
            reservation_id: Uuid::now_v7(),
            slot_id,
            reserved_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_hold(handle) {
            // Unit was taken but nothing can reference it: give it back
            warn!(%slot_id, "Failed to record hold, releasing unit: {}", e);
            self.store.release_unit(slot_id)?;
            self.metrics.record_reservation("hold_failed");
            return Err(e);
        }

        self.metrics.record_reservation("ok");
        debug!(
            %slot_id,
            reservation_id = %handle.reservation_id,
            reserved = slot.reserved_count,
            capacity = slot.capacity,
            "Slot unit reserved"
        );
        Ok(handle)
    }

    /// Give a reserved unit back. Releasing an already released handle is a no-op.
    ///
    /// Returns whether this call performed the release.
    pub fn release(&self, handle: &ReservationHandle) -> Result<bool> {
        self.release_reservation(handle.slot_id, handle.reservation_id)
    }

    /// Release by ids (bookings store the reservation id, not the whole handle)
    pub fn release_reservation(&self, slot_id: Uuid, reservation_id: Uuid) -> Result<bool> {
        if !self.store.release_hold(reservation_id)? {
            debug!(%slot_id, %reservation_id, "Reservation already released");
            return Ok(false);
        }

        let slot = self.store.release_unit(slot_id)?;
        debug!(
            %slot_id,
            %reservation_id,
            reserved = slot.reserved_count,
            "Slot unit released"
        );
        Ok(true)
    }

    /// Stop accepting reservations; existing bookings keep their units
    pub fn withdraw(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        let slot = self.store.set_slot_active(slot_id, false)?;
        info!(%slot_id, reserved = slot.reserved_count, "Slot withdrawn");
        Ok(slot)
    }

    /// Deactivate every active slot whose end has passed
    pub fn deactivate_elapsed(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut deactivated = Vec::new();

        for slot in self.store.active_slots()? {
            if slot.is_elapsed(now) {
                self.store.set_slot_active(slot.slot_id, false)?;
                deactivated.push(slot.slot_id);
            }
        }

        if !deactivated.is_empty() {
            info!("Deactivated {} elapsed slots", deactivated.len());
        }
        Ok(deactivated)
    }
}

impl std::fmt::Debug for SlotLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLedger").finish_non_exhaustive()
    }
}
