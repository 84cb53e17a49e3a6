//! Booking lifecycle
//!
//! ```text
//!   pending ──pay──► paid ──confirm──► confirmed ──complete──► completed
//!      │               │
//!      ├─fail──► payment_failed
//!      ├─cancel─► cancelled ◄──refund──┘
//!      └─expire─► expired
//! ```
//!
//! Every transition is a conditional update on the booking record: the
//! table in [`BookingState::on`] is evaluated against the state read under the
//! record lock, so two racing actions (expiry sweep vs. late payment) resolve
//! to exactly one winner. The accepted transition's event is handed to the
//! notifier inside that same critical section, which is what keeps
//! per-booking events in commit order.

use crate::{
    metrics::Metrics,
    notify::Notifier,
    slots::SlotLedger,
    store::Store,
    types::{
        Booking, BookingAction, BookingState, EventType, HoldState, NotificationEvent,
        PaymentRecord, SessionRecord,
    },
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of a transition request
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Transition accepted and committed
    Applied {
        /// Booking after the transition
        booking: Booking,
        /// State before the transition
        from: BookingState,
        /// Event that was published
        event: NotificationEvent,
    },
    /// Same transition was already applied; nothing changed
    Unchanged(Booking),
}

impl Outcome {
    /// Booking after the request
    pub fn booking(&self) -> &Booking {
        match self {
            Outcome::Applied { booking, .. } => booking,
            Outcome::Unchanged(booking) => booking,
        }
    }

    /// Consume into the booking
    pub fn into_booking(self) -> Booking {
        match self {
            Outcome::Applied { booking, .. } => booking,
            Outcome::Unchanged(booking) => booking,
        }
    }

    /// Whether this call changed the booking
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }
}

/// Owns the lifecycle of booking records
#[derive(Clone)]
pub struct BookingStateMachine {
    store: Arc<dyn Store>,
    slots: SlotLedger,
    notifier: Arc<dyn Notifier>,
    metrics: Metrics,
}

impl BookingStateMachine {
    /// Create new state machine
    pub fn new(
        store: Arc<dyn Store>,
        slots: SlotLedger,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            slots,
            notifier,
            metrics,
        }
    }

    /// Reserve a unit of the slot and create a `pending` booking for it.
    ///
    /// If the booking cannot be persisted the unit is released before the
    /// error is returned. `booking_created` is published while the new record
    /// is still locked, so it precedes every later event of the booking.
    pub fn create(&self, slot_id: Uuid, nurse_id: Uuid) -> Result<Booking> {
        let slot = self.slots.slot(slot_id)?;
        let handle = self.slots.reserve(slot_id)?;

        let now = Utc::now();
        let booking = Booking {
            booking_id: Uuid::now_v7(),
            slot_id,
            nurse_id,
            mentor_id: slot.mentor_id,
            reservation_id: handle.reservation_id,
            state: BookingState::Pending,
            amount: slot.price,
            payment_id: None,
            session_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
            decided_at: None,
        };

        let notifier = &self.notifier;
        let inserted = self.store.insert_booking(booking.clone(), &mut |stored| {
            notifier.publish(NotificationEvent::for_booking(
                EventType::BookingCreated,
                stored,
                json!({ "amount": stored.amount, "state": stored.state }),
            ));
        });

        if let Err(e) = inserted {
            error!(%slot_id, %nurse_id, "Failed to persist booking, releasing hold: {}", e);
            if let Err(release_err) = self.slots.release(&handle) {
                error!(
                    %slot_id,
                    reservation_id = %handle.reservation_id,
                    "Failed to release orphaned hold: {}",
                    release_err
                );
            }
            return Err(e);
        }

        info!(
            booking_id = %booking.booking_id,
            %slot_id,
            %nurse_id,
            "Booking created"
        );
        Ok(booking)
    }

    /// Get booking by ID
    pub fn booking(&self, booking_id: Uuid) -> Result<Booking> {
        self.store.get_booking(booking_id)
    }

    /// Bookings made by a nurse
    pub fn bookings_for_nurse(&self, nurse_id: Uuid) -> Result<Vec<Booking>> {
        self.store.bookings_for_nurse(nurse_id)
    }

    /// Bookings currently in a state
    pub fn bookings_in_state(&self, state: BookingState) -> Result<Vec<Booking>> {
        self.store.bookings_in_state(state)
    }

    /// `pending -> paid` for a completed payment
    pub fn mark_paid(&self, booking_id: Uuid, payment: &PaymentRecord) -> Result<Outcome> {
        let payment_id = payment.payment_id;
        let amount = payment.amount;

        self.apply(
            booking_id,
            BookingAction::PaymentCompleted,
            json!({
                "payment_id": payment_id,
                "transaction_id": payment.transaction_id,
                "amount": amount,
            }),
            |booking| booking.state == BookingState::Paid && booking.payment_id == Some(payment_id),
            |booking| {
                if booking.amount != amount {
                    return Err(Error::AmountMismatch {
                        expected: booking.amount,
                        actual: amount,
                    });
                }
                booking.payment_id = Some(payment_id);
                Ok(())
            },
        )
    }

    /// `pending -> payment_failed`
    pub fn mark_payment_failed(&self, booking_id: Uuid, transaction_id: &str) -> Result<Outcome> {
        self.apply(
            booking_id,
            BookingAction::PaymentFailed,
            json!({ "transaction_id": transaction_id }),
            |booking| booking.state == BookingState::PaymentFailed,
            |_| Ok(()),
        )
    }

    /// `pending -> cancelled`. Cancelling an already cancelled booking is a no-op.
    pub fn cancel(&self, booking_id: Uuid, reason: Option<&str>) -> Result<Outcome> {
        self.apply(
            booking_id,
            BookingAction::Cancel,
            json!({ "reason": reason }),
            |booking| booking.state == BookingState::Cancelled,
            |_| Ok(()),
        )
    }

    /// `pending -> expired`
    pub fn expire(&self, booking_id: Uuid) -> Result<Outcome> {
        self.apply(
            booking_id,
            BookingAction::Expire,
            json!({}),
            |booking| booking.state == BookingState::Expired,
            |_| Ok(()),
        )
    }

    /// `paid -> confirmed` once the session exists
    pub fn confirm(&self, booking_id: Uuid, session: &SessionRecord) -> Result<Outcome> {
        let session_id = session.session_id;

        self.apply(
            booking_id,
            BookingAction::SessionProvisioned,
            json!({
                "session_id": session_id,
                "join_url": session.join_url,
                "scheduled_time": session.scheduled_time,
            }),
            |booking| {
                booking.state == BookingState::Confirmed && booking.session_id == Some(session_id)
            },
            |booking| {
                booking.session_id = Some(session_id);
                Ok(())
            },
        )
    }

    /// `confirmed -> completed`
    pub fn complete(&self, booking_id: Uuid) -> Result<Outcome> {
        self.apply(
            booking_id,
            BookingAction::Complete,
            json!({}),
            |booking| booking.state == BookingState::Completed,
            |_| Ok(()),
        )
    }

    /// `paid -> cancelled` after the gateway confirmed the refund
    pub fn refund(&self, booking_id: Uuid, payment: &PaymentRecord) -> Result<Outcome> {
        let payment_id = payment.payment_id;

        self.apply(
            booking_id,
            BookingAction::RefundConfirmed,
            json!({
                "payment_id": payment_id,
                "transaction_id": payment.transaction_id,
            }),
            |booking| {
                booking.state == BookingState::Cancelled && booking.payment_id == Some(payment_id)
            },
            |_| Ok(()),
        )
    }

    /// Release the hold of a terminal booking if a previous release did not land
    pub fn ensure_released(&self, booking: &Booking) -> Result<bool> {
        if !booking.state.releases_capacity() {
            return Ok(false);
        }
        match self.store.hold_state(booking.reservation_id)? {
            Some(HoldState::Held) => self
                .slots
                .release_reservation(booking.slot_id, booking.reservation_id),
            _ => Ok(false),
        }
    }

    fn apply(
        &self,
        booking_id: Uuid,
        action: BookingAction,
        payload: serde_json::Value,
        already_applied: impl Fn(&Booking) -> bool,
        mut mutate: impl FnMut(&mut Booking) -> Result<()>,
    ) -> Result<Outcome> {
        let mut from = None;
        let mut published = None;
        let mut unchanged = false;

        let result = self.store.update_booking(booking_id, &mut |booking| {
            if already_applied(booking) {
                unchanged = true;
                return Ok(());
            }

            let next = booking.state.on(action)?;
            mutate(booking)?;

            from = Some(booking.state);
            booking.state = next;
            booking.version += 1;
            booking.updated_at = next_timestamp(booking.updated_at, Utc::now());
            if booking.decided_at.is_none() {
                booking.decided_at = Some(booking.updated_at);
            }

            let event = NotificationEvent::for_booking(action.event_type(), booking, payload.clone());
            self.notifier.publish(event.clone());
            published = Some(event);
            Ok(())
        });

        let booking = match result {
            Ok(booking) => booking,
            Err(e) => {
                if let Error::InvalidTransition { from, .. } = &e {
                    warn!(%booking_id, state = %from, "Rejected attempt to {} booking", action.name());
                    self.metrics.record_rejected_transition(action.name());
                }
                return Err(e);
            }
        };

        if unchanged {
            // A replayed release request still finishes a release that did not land
            self.release_after(&booking);
            return Ok(Outcome::Unchanged(booking));
        }

        let (from, event) = match (from, published) {
            (Some(from), Some(event)) => (from, event),
            _ => {
                return Err(Error::Concurrency(format!(
                    "Booking {} update committed without a transition",
                    booking_id
                )))
            }
        };

        self.metrics.record_transition(from.as_str(), booking.state.as_str());
        info!(
            %booking_id,
            from = %from,
            to = %booking.state,
            version = booking.version,
            "Booking transition"
        );

        self.release_after(&booking);

        Ok(Outcome::Applied {
            booking,
            from,
            event,
        })
    }

    fn release_after(&self, booking: &Booking) {
        if let Err(e) = self.ensure_released(booking) {
            // Sweeper retries holds of terminal bookings
            error!(
                booking_id = %booking.booking_id,
                slot_id = %booking.slot_id,
                "Failed to release slot unit: {}",
                e
            );
            self.metrics.record_anomaly("release_failed");
        }
    }
}

impl std::fmt::Debug for BookingStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingStateMachine").finish_non_exhaustive()
    }
}

/// Strictly increasing per booking even when the wall clock is not
fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}
