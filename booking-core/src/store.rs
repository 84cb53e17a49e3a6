//! Storage seam for the booking engine
//!
//! # Collections
//!
//! - `slots` - Availability slots (key: slot_id)
//! - `holds` - Reservation holds (key: reservation_id)
//! - `bookings` - Bookings (key: booking_id)
//! - `payments` - Payment records (key: transaction_id, unique)
//! - `payments_by_booking` - Secondary index booking_id -> transaction ids
//! - `completions` - booking_id -> the one completed transaction
//! - `sessions` - Session records (key: session_id)
//! - `sessions_by_booking` - booking_id -> session_id (unique)
//!
//! Every conditional mutation runs while the single record it touches is
//! exclusively held, so calls on the same key are linearized and calls on
//! different keys never wait on each other.

use crate::{
    error::{Error, Result},
    types::{
        AvailabilitySlot, Booking, BookingState, HoldState, PaymentRecord, PaymentStatus,
        ReservationHandle, SessionRecord,
    },
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Persistence boundary used by every engine component.
///
/// `update_*` methods pass the current record to `apply` while it is
/// exclusively held; the record is replaced only if `apply` returns `Ok`, and
/// that return is the commit point.
pub trait Store: Send + Sync {
    /// Insert a new slot
    fn insert_slot(&self, slot: AvailabilitySlot) -> Result<()>;

    /// Get slot by ID
    fn get_slot(&self, slot_id: Uuid) -> Result<AvailabilitySlot>;

    /// All slots of a mentor, ordered by start
    fn slots_for_mentor(&self, mentor_id: Uuid) -> Result<Vec<AvailabilitySlot>>;

    /// All slots still accepting reservations
    fn active_slots(&self) -> Result<Vec<AvailabilitySlot>>;

    /// Take one unit if `reserved_count + 1 <= capacity` and the slot is active
    fn reserve_unit(&self, slot_id: Uuid) -> Result<AvailabilitySlot>;

    /// Give one unit back
    fn release_unit(&self, slot_id: Uuid) -> Result<AvailabilitySlot>;

    /// Activate or deactivate a slot
    fn set_slot_active(&self, slot_id: Uuid, active: bool) -> Result<AvailabilitySlot>;

    /// Record a new hold in state `Held`
    fn insert_hold(&self, handle: ReservationHandle) -> Result<()>;

    /// Flip a hold `Held -> Released`; `true` only for the call that flipped it
    fn release_hold(&self, reservation_id: Uuid) -> Result<bool>;

    /// Current hold state, if the hold exists
    fn hold_state(&self, reservation_id: Uuid) -> Result<Option<HoldState>>;

    /// Insert a new booking. `on_insert` runs once the record is stored and
    /// before any other caller can read or update it.
    fn insert_booking(&self, booking: Booking, on_insert: &mut dyn FnMut(&Booking)) -> Result<()>;

    /// Get booking by ID
    fn get_booking(&self, booking_id: Uuid) -> Result<Booking>;

    /// Conditionally update a booking
    fn update_booking(
        &self,
        booking_id: Uuid,
        apply: &mut dyn FnMut(&mut Booking) -> Result<()>,
    ) -> Result<Booking>;

    /// Bookings currently in `state`
    fn bookings_in_state(&self, state: BookingState) -> Result<Vec<Booking>>;

    /// Bookings made by a nurse
    fn bookings_for_nurse(&self, nurse_id: Uuid) -> Result<Vec<Booking>>;

    /// Insert a payment; fails with `DuplicateTransaction` if the id exists
    fn insert_payment(&self, payment: PaymentRecord) -> Result<()>;

    /// Get payment by transaction ID
    fn get_payment(&self, transaction_id: &str) -> Result<PaymentRecord>;

    /// Conditionally update a payment
    fn update_payment(
        &self,
        transaction_id: &str,
        apply: &mut dyn FnMut(&mut PaymentRecord) -> Result<()>,
    ) -> Result<PaymentRecord>;

    /// Payments recorded for a booking, oldest first
    fn payments_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentRecord>>;

    /// Claim the single completed-payment slot of a booking
    fn claim_completion(&self, booking_id: Uuid, transaction_id: &str) -> Result<()>;

    /// The completed (or since refunded) payment of a booking, if any
    fn completed_payment(&self, booking_id: Uuid) -> Result<Option<PaymentRecord>>;

    /// Insert a session unless the booking already has one; returns the stored record
    fn insert_session(&self, session: SessionRecord) -> Result<SessionRecord>;

    /// Session of a booking
    fn session_for_booking(&self, booking_id: Uuid) -> Result<Option<SessionRecord>>;

    /// Conditionally update a session
    fn update_session(
        &self,
        session_id: Uuid,
        apply: &mut dyn FnMut(&mut SessionRecord) -> Result<()>,
    ) -> Result<SessionRecord>;
}

/// In-process store backed by sharded concurrent maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<Uuid, AvailabilitySlot>,
    holds: DashMap<Uuid, HoldState>,
    bookings: DashMap<Uuid, Booking>,
    payments: DashMap<String, PaymentRecord>,
    payments_by_booking: DashMap<Uuid, Vec<String>>,
    completions: DashMap<Uuid, String>,
    sessions: DashMap<Uuid, SessionRecord>,
    sessions_by_booking: DashMap<Uuid, Uuid>,
}

impl MemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_slot(&self, slot: AvailabilitySlot) -> Result<()> {
        match self.slots.entry(slot.slot_id) {
            Entry::Occupied(_) => Err(Error::Storage(format!(
                "Slot {} already exists",
                slot.slot_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(slot);
                Ok(())
            }
        }
    }

    fn get_slot(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        self.slots
            .get(&slot_id)
            .map(|slot| slot.clone())
            .ok_or(Error::SlotNotFound(slot_id))
    }

    fn slots_for_mentor(&self, mentor_id: Uuid) -> Result<Vec<AvailabilitySlot>> {
        let mut slots: Vec<AvailabilitySlot> = self
            .slots
            .iter()
            .filter(|slot| slot.mentor_id == mentor_id)
            .map(|slot| slot.clone())
            .collect();
        slots.sort_by_key(|slot| slot.start);
        Ok(slots)
    }

    fn active_slots(&self) -> Result<Vec<AvailabilitySlot>> {
        Ok(self
            .slots
            .iter()
            .filter(|slot| slot.active)
            .map(|slot| slot.clone())
            .collect())
    }

    fn reserve_unit(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        let mut slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(Error::SlotNotFound(slot_id))?;

        if !slot.active {
            return Err(Error::SlotInactive(slot_id));
        }
        if slot.reserved_count >= slot.capacity {
            return Err(Error::SlotFull(slot_id));
        }

        slot.reserved_count += 1;
        Ok(slot.clone())
    }

    fn release_unit(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        let mut slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(Error::SlotNotFound(slot_id))?;

        if slot.reserved_count == 0 {
            return Err(Error::Storage(format!(
                "Slot {} reserved_count would underflow",
                slot_id
            )));
        }

        slot.reserved_count -= 1;
        Ok(slot.clone())
    }

    fn set_slot_active(&self, slot_id: Uuid, active: bool) -> Result<AvailabilitySlot> {
        let mut slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(Error::SlotNotFound(slot_id))?;
        slot.active = active;
        Ok(slot.clone())
    }

    fn insert_hold(&self, handle: ReservationHandle) -> Result<()> {
        match self.holds.entry(handle.reservation_id) {
            Entry::Occupied(_) => Err(Error::Storage(format!(
                "Reservation {} already exists",
                handle.reservation_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(HoldState::Held);
                Ok(())
            }
        }
    }

    fn release_hold(&self, reservation_id: Uuid) -> Result<bool> {
        let mut hold = self
            .holds
            .get_mut(&reservation_id)
            .ok_or_else(|| Error::Storage(format!("Reservation {} not found", reservation_id)))?;

        match *hold {
            HoldState::Held => {
                *hold = HoldState::Released;
                Ok(true)
            }
            HoldState::Released => Ok(false),
        }
    }

    fn hold_state(&self, reservation_id: Uuid) -> Result<Option<HoldState>> {
        Ok(self.holds.get(&reservation_id).map(|hold| *hold))
    }

    fn insert_booking(&self, booking: Booking, on_insert: &mut dyn FnMut(&Booking)) -> Result<()> {
        match self.bookings.entry(booking.booking_id) {
            Entry::Occupied(_) => Err(Error::Storage(format!(
                "Booking {} already exists",
                booking.booking_id
            ))),
            Entry::Vacant(entry) => {
                // The returned guard keeps the shard locked until dropped
                let stored = entry.insert(booking);
                on_insert(&stored);
                Ok(())
            }
        }
    }

    fn get_booking(&self, booking_id: Uuid) -> Result<Booking> {
        self.bookings
            .get(&booking_id)
            .map(|booking| booking.clone())
            .ok_or(Error::BookingNotFound(booking_id))
    }

    fn update_booking(
        &self,
        booking_id: Uuid,
        apply: &mut dyn FnMut(&mut Booking) -> Result<()>,
    ) -> Result<Booking> {
        let mut guard = self
            .bookings
            .get_mut(&booking_id)
            .ok_or(Error::BookingNotFound(booking_id))?;

        let mut updated = guard.clone();
        apply(&mut updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    fn bookings_in_state(&self, state: BookingState) -> Result<Vec<Booking>> {
        Ok(self
            .bookings
            .iter()
            .filter(|booking| booking.state == state)
            .map(|booking| booking.clone())
            .collect())
    }

    fn bookings_for_nurse(&self, nurse_id: Uuid) -> Result<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|booking| booking.nurse_id == nurse_id)
            .map(|booking| booking.clone())
            .collect();
        bookings.sort_by_key(|booking| booking.created_at);
        Ok(bookings)
    }

    fn insert_payment(&self, payment: PaymentRecord) -> Result<()> {
        let booking_id = payment.booking_id;
        let transaction_id = payment.transaction_id.clone();

        match self.payments.entry(transaction_id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateTransaction(transaction_id)),
            Entry::Vacant(entry) => {
                entry.insert(payment);
            }
        }

        self.payments_by_booking
            .entry(booking_id)
            .or_default()
            .push(transaction_id);
        Ok(())
    }

    fn get_payment(&self, transaction_id: &str) -> Result<PaymentRecord> {
        self.payments
            .get(transaction_id)
            .map(|payment| payment.clone())
            .ok_or_else(|| Error::PaymentNotFound(transaction_id.to_string()))
    }

    fn update_payment(
        &self,
        transaction_id: &str,
        apply: &mut dyn FnMut(&mut PaymentRecord) -> Result<()>,
    ) -> Result<PaymentRecord> {
        let mut guard = self
            .payments
            .get_mut(transaction_id)
            .ok_or_else(|| Error::PaymentNotFound(transaction_id.to_string()))?;

        let mut updated = guard.clone();
        apply(&mut updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    fn payments_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentRecord>> {
        let transaction_ids = self
            .payments_by_booking
            .get(&booking_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        transaction_ids
            .iter()
            .map(|transaction_id| self.get_payment(transaction_id))
            .collect()
    }

    fn claim_completion(&self, booking_id: Uuid, transaction_id: &str) -> Result<()> {
        match self.completions.entry(booking_id) {
            Entry::Occupied(entry) if entry.get() != transaction_id => Err(Error::AlreadyPaid {
                booking_id,
                transaction_id: entry.get().clone(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(transaction_id.to_string());
                Ok(())
            }
        }
    }

    fn completed_payment(&self, booking_id: Uuid) -> Result<Option<PaymentRecord>> {
        let transaction_id = match self.completions.get(&booking_id) {
            Some(transaction_id) => transaction_id.clone(),
            None => return Ok(None),
        };

        let payment = self.get_payment(&transaction_id)?;
        match payment.status {
            PaymentStatus::Completed | PaymentStatus::Refunded => Ok(Some(payment)),
            // Claimed but the status write has not landed
            _ => Ok(None),
        }
    }

    fn insert_session(&self, session: SessionRecord) -> Result<SessionRecord> {
        match self.sessions_by_booking.entry(session.booking_id) {
            Entry::Occupied(entry) => {
                let session_id = *entry.get();
                self.sessions
                    .get(&session_id)
                    .map(|existing| existing.clone())
                    .ok_or(Error::SessionNotFound(session_id))
            }
            Entry::Vacant(entry) => {
                entry.insert(session.session_id);
                self.sessions.insert(session.session_id, session.clone());
                Ok(session)
            }
        }
    }

    fn session_for_booking(&self, booking_id: Uuid) -> Result<Option<SessionRecord>> {
        let session_id = match self.sessions_by_booking.get(&booking_id) {
            Some(session_id) => *session_id,
            None => return Ok(None),
        };
        Ok(self.sessions.get(&session_id).map(|session| session.clone()))
    }

    fn update_session(
        &self,
        session_id: Uuid,
        apply: &mut dyn FnMut(&mut SessionRecord) -> Result<()>,
    ) -> Result<SessionRecord> {
        let mut guard = self
            .sessions
            .get_mut(&session_id)
            .ok_or(Error::SessionNotFound(session_id))?;

        let mut updated = guard.clone();
        apply(&mut updated)?;
        *guard = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gateway, SessionType};
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    fn slot(capacity: u32) -> AvailabilitySlot {
        let start = Utc::now() + Duration::hours(1);
        AvailabilitySlot {
            slot_id: Uuid::now_v7(),
            mentor_id: Uuid::now_v7(),
            start,
            end: start + Duration::minutes(45),
            capacity,
            reserved_count: 0,
            price: Decimal::new(5000, 2),
            session_type: SessionType::Video,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn payment(booking_id: Uuid, transaction_id: &str) -> PaymentRecord {
        PaymentRecord {
            payment_id: Uuid::now_v7(),
            booking_id,
            amount: Decimal::new(5000, 2),
            gateway: Gateway::new("stripe"),
            transaction_id: transaction_id.to_string(),
            status: PaymentStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_reserve_unit_respects_capacity() {
        let store = MemoryStore::new();
        let slot = slot(2);
        let slot_id = slot.slot_id;
        store.insert_slot(slot).unwrap();

        assert_eq!(store.reserve_unit(slot_id).unwrap().reserved_count, 1);
        assert_eq!(store.reserve_unit(slot_id).unwrap().reserved_count, 2);
        assert!(matches!(store.reserve_unit(slot_id), Err(Error::SlotFull(_))));
        assert_eq!(store.get_slot(slot_id).unwrap().reserved_count, 2);
    }

    #[test]
    fn test_reserve_unit_inactive_slot() {
        let store = MemoryStore::new();
        let slot = slot(2);
        let slot_id = slot.slot_id;
        store.insert_slot(slot).unwrap();
        store.set_slot_active(slot_id, false).unwrap();

        assert!(matches!(store.reserve_unit(slot_id), Err(Error::SlotInactive(_))));
        assert!(matches!(
            store.reserve_unit(Uuid::now_v7()),
            Err(Error::SlotNotFound(_))
        ));
    }

    #[test]
    fn test_release_unit_never_underflows() {
        let store = MemoryStore::new();
        let slot = slot(1);
        let slot_id = slot.slot_id;
        store.insert_slot(slot).unwrap();

        assert!(store.release_unit(slot_id).is_err());
        assert_eq!(store.get_slot(slot_id).unwrap().reserved_count, 0);
    }

    #[test]
    fn test_release_hold_flips_once() {
        let store = MemoryStore::new();
        let handle = ReservationHandle {
            reservation_id: Uuid::now_v7(),
            slot_id: Uuid::now_v7(),
            reserved_at: Utc::now(),
        };
        store.insert_hold(handle).unwrap();

        assert!(store.release_hold(handle.reservation_id).unwrap());
        assert!(!store.release_hold(handle.reservation_id).unwrap());
        assert_eq!(
            store.hold_state(handle.reservation_id).unwrap(),
            Some(HoldState::Released)
        );
    }

    #[test]
    fn test_duplicate_transaction_rejected() {
        let store = MemoryStore::new();
        let booking_id = Uuid::now_v7();
        store.insert_payment(payment(booking_id, "txn_a")).unwrap();

        let err = store.insert_payment(payment(booking_id, "txn_a")).unwrap_err();
        assert!(matches!(err, Error::DuplicateTransaction(_)));
        assert_eq!(store.payments_for_booking(booking_id).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_completion_single_winner() {
        let store = MemoryStore::new();
        let booking_id = Uuid::now_v7();

        store.claim_completion(booking_id, "txn_a").unwrap();
        store.claim_completion(booking_id, "txn_a").unwrap();
        assert!(matches!(
            store.claim_completion(booking_id, "txn_b"),
            Err(Error::AlreadyPaid { .. })
        ));
    }

    #[test]
    fn test_failed_apply_leaves_payment_untouched() {
        let store = MemoryStore::new();
        let booking_id = Uuid::now_v7();
        store.insert_payment(payment(booking_id, "txn_a")).unwrap();

        let result = store.update_payment("txn_a", &mut |p| {
            p.status = PaymentStatus::Completed;
            Err(Error::Validation("rejected".into()))
        });
        assert!(result.is_err());
        assert_eq!(
            store.get_payment("txn_a").unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[test]
    fn test_insert_booking_callback_runs_under_record_lock() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let booking = Booking {
            booking_id: Uuid::now_v7(),
            slot_id: Uuid::now_v7(),
            nurse_id: Uuid::now_v7(),
            mentor_id: Uuid::now_v7(),
            reservation_id: Uuid::now_v7(),
            state: BookingState::Pending,
            amount: Decimal::new(5000, 2),
            payment_id: None,
            session_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
            decided_at: None,
        };
        let booking_id = booking.booking_id;

        let mut calls = 0;
        store
            .insert_booking(booking.clone(), &mut |stored| {
                calls += 1;
                assert_eq!(stored.booking_id, booking_id);
                assert!(matches!(
                    store.bookings.try_get(&booking_id),
                    dashmap::try_result::TryResult::Locked
                ));
            })
            .unwrap();
        assert_eq!(calls, 1);

        let duplicate = store.insert_booking(booking, &mut |_| calls += 1);
        assert!(matches!(duplicate, Err(Error::Storage(_))));
        assert_eq!(calls, 1);
    }
}
