//! Payment attempts and gateway outcomes
//!
//! A payment record is created on initiation and afterwards only moves on
//! gateway callbacks:
//!
//! - `pending -> completed | failed`
//! - `completed -> refunded`
//!
//! Replaying an outcome that is already recorded is accepted silently. Any
//! other terminal-to-terminal change is a [`Error::ConflictingOutcome`] and
//! is never applied. A refund for a payment that never completed is a
//! validation error.
//!
//! The payment write and the booking transition are two commits. When the
//! second one fails the payment stays recorded and [`PaymentLedger::reconcile`]
//! re-drives the booking from it; the engine calls it on every booking read
//! and the sweeper calls it before expiring anything.

use crate::{
    booking::BookingStateMachine,
    metrics::Metrics,
    store::Store,
    types::{Booking, BookingState, Gateway, PaymentRecord, PaymentStatus},
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at drawing a fresh transaction id before giving up
const MAX_ID_ATTEMPTS: usize = 3;

/// Result of an outcome report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeReport {
    /// Payment after the report
    pub payment: PaymentRecord,

    /// Booking after the report
    pub booking: Booking,

    /// The same outcome had already been recorded
    pub replayed: bool,
}

/// Records payment attempts and correlates them to bookings
#[derive(Clone)]
pub struct PaymentLedger {
    store: Arc<dyn Store>,
    bookings: BookingStateMachine,
    metrics: Metrics,
}

impl PaymentLedger {
    /// Create new payment ledger
    pub fn new(store: Arc<dyn Store>, bookings: BookingStateMachine, metrics: Metrics) -> Self {
        Self {
            store,
            bookings,
            metrics,
        }
    }

    /// Start a payment attempt for a pending booking
    pub fn initiate(
        &self,
        booking_id: Uuid,
        amount: Decimal,
        gateway: Gateway,
    ) -> Result<PaymentRecord> {
        if gateway.as_str().trim().is_empty() {
            return Err(Error::Validation("Gateway must not be empty".to_string()));
        }

        let booking = self.store.get_booking(booking_id)?;
        if booking.state != BookingState::Pending {
            return Err(Error::InvalidTransition {
                from: booking.state,
                action: "initiate payment for",
            });
        }
        if amount != booking.amount {
            return Err(Error::AmountMismatch {
                expected: booking.amount,
                actual: amount,
            });
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let now = Utc::now();
            let payment = PaymentRecord {
                payment_id: Uuid::now_v7(),
                booking_id,
                amount,
                gateway: gateway.clone(),
                transaction_id: new_transaction_id(),
                status: PaymentStatus::Pending,
                created_at: now,
                updated_at: now,
            };

            match self.store.insert_payment(payment.clone()) {
                Ok(()) => {
                    info!(
                        %booking_id,
                        transaction_id = %payment.transaction_id,
                        gateway = %payment.gateway,
                        "Payment initiated"
                    );
                    return Ok(payment);
                }
                Err(Error::DuplicateTransaction(id)) if attempts < MAX_ID_ATTEMPTS => {
                    warn!(transaction_id = %id, "Transaction id collision, drawing a new one");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply a gateway outcome and drive the booking accordingly
    pub fn report_outcome(&self, transaction_id: &str, status: PaymentStatus) -> Result<OutcomeReport> {
        if !status.is_terminal() {
            return Err(Error::Validation(
                "Reported outcome must be terminal".to_string(),
            ));
        }

        let mut replayed = false;
        let store = self.store.clone();

        let result = self.store.update_payment(transaction_id, &mut |payment| {
            if payment.status == status {
                replayed = true;
                return Ok(());
            }

            match (payment.status, status) {
                (PaymentStatus::Pending, PaymentStatus::Completed) => {
                    store.claim_completion(payment.booking_id, &payment.transaction_id)?;
                }
                (PaymentStatus::Pending, PaymentStatus::Failed) => {}
                (PaymentStatus::Completed, PaymentStatus::Refunded) => {}
                (PaymentStatus::Pending, PaymentStatus::Refunded) => {
                    return Err(Error::Validation(format!(
                        "Payment {} cannot be refunded before it completes",
                        payment.transaction_id
                    )))
                }
                (recorded, reported) => {
                    return Err(Error::ConflictingOutcome {
                        transaction_id: payment.transaction_id.clone(),
                        recorded,
                        reported,
                    })
                }
            }

            payment.status = status;
            payment.updated_at = Utc::now();
            Ok(())
        });

        let payment = match result {
            Ok(payment) => payment,
            Err(e) => {
                match &e {
                    Error::ConflictingOutcome { recorded, .. } => {
                        warn!(
                            %transaction_id,
                            recorded = %recorded,
                            reported = %status,
                            "Conflicting payment outcome rejected"
                        );
                        self.metrics.record_anomaly("conflicting_outcome");
                    }
                    Error::AlreadyPaid { booking_id, .. } => {
                        warn!(
                            %transaction_id,
                            %booking_id,
                            "Second completed payment for booking rejected"
                        );
                        self.metrics.record_anomaly("already_paid");
                    }
                    _ => {}
                }
                self.metrics.record_payment_outcome(status.as_str(), e.kind());
                return Err(e);
            }
        };

        let result_label = if replayed { "replayed" } else { "applied" };
        self.metrics.record_payment_outcome(status.as_str(), result_label);
        debug!(%transaction_id, status = %status, replayed, "Payment outcome recorded");

        let booking = self.drive_booking(&payment)?;

        Ok(OutcomeReport {
            payment,
            booking,
            replayed,
        })
    }

    /// Re-drive a booking from its recorded payments
    pub fn reconcile(&self, booking_id: Uuid) -> Result<Booking> {
        let booking = self.store.get_booking(booking_id)?;

        match booking.state {
            BookingState::Pending => {
                if let Some(payment) = self.store.completed_payment(booking_id)? {
                    info!(
                        %booking_id,
                        transaction_id = %payment.transaction_id,
                        "Reconciling completed payment against pending booking"
                    );
                    self.metrics.record_anomaly("reconciled_completion");
                    let booking = self.on_completed(&payment)?;
                    if payment.status == PaymentStatus::Refunded {
                        return self.on_refunded(&payment);
                    }
                    return Ok(booking);
                }

                let payments = self.store.payments_for_booking(booking_id)?;
                if let Some(failed) = payments
                    .iter()
                    .find(|payment| payment.status == PaymentStatus::Failed)
                {
                    info!(
                        %booking_id,
                        transaction_id = %failed.transaction_id,
                        "Reconciling failed payment against pending booking"
                    );
                    self.metrics.record_anomaly("reconciled_failure");
                    return self.on_failed(failed);
                }

                Ok(booking)
            }
            BookingState::Paid => match self.store.completed_payment(booking_id)? {
                Some(payment) if payment.status == PaymentStatus::Refunded => {
                    self.metrics.record_anomaly("reconciled_refund");
                    self.on_refunded(&payment)
                }
                _ => Ok(booking),
            },
            _ => Ok(booking),
        }
    }

    /// Get payment by transaction ID
    pub fn payment(&self, transaction_id: &str) -> Result<PaymentRecord> {
        self.store.get_payment(transaction_id)
    }

    /// All payment attempts of a booking
    pub fn payments_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentRecord>> {
        self.store.payments_for_booking(booking_id)
    }

    fn drive_booking(&self, payment: &PaymentRecord) -> Result<Booking> {
        match payment.status {
            PaymentStatus::Completed => self.on_completed(payment),
            PaymentStatus::Failed => self.on_failed(payment),
            PaymentStatus::Refunded => self.on_refunded(payment),
            PaymentStatus::Pending => self.store.get_booking(payment.booking_id),
        }
    }

    fn on_completed(&self, payment: &PaymentRecord) -> Result<Booking> {
        match self.bookings.mark_paid(payment.booking_id, payment) {
            Ok(outcome) => Ok(outcome.into_booking()),
            Err(Error::InvalidTransition { from, .. }) => {
                let booking = self.store.get_booking(payment.booking_id)?;
                if booking.payment_id != Some(payment.payment_id) && from.releases_capacity() {
                    // Money moved for a booking that already lost its slot
                    warn!(
                        booking_id = %booking.booking_id,
                        transaction_id = %payment.transaction_id,
                        state = %from,
                        "Completed payment for a closed booking; refund required"
                    );
                    self.metrics.record_anomaly("refund_required");
                }
                Ok(booking)
            }
            Err(e) => Err(e),
        }
    }

    fn on_failed(&self, payment: &PaymentRecord) -> Result<Booking> {
        match self
            .bookings
            .mark_payment_failed(payment.booking_id, &payment.transaction_id)
        {
            Ok(outcome) => Ok(outcome.into_booking()),
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(
                    booking_id = %payment.booking_id,
                    state = %from,
                    "Failed payment ignored for booking that moved on"
                );
                self.store.get_booking(payment.booking_id)
            }
            Err(e) => Err(e),
        }
    }

    fn on_refunded(&self, payment: &PaymentRecord) -> Result<Booking> {
        match self.bookings.refund(payment.booking_id, payment) {
            Ok(outcome) => Ok(outcome.into_booking()),
            Err(Error::InvalidTransition { from, .. }) => {
                warn!(
                    booking_id = %payment.booking_id,
                    transaction_id = %payment.transaction_id,
                    state = %from,
                    "Refund recorded but booking cannot be cancelled"
                );
                self.metrics.record_anomaly("refund_unmatched");
                self.store.get_booking(payment.booking_id)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for PaymentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentLedger").finish_non_exhaustive()
    }
}

/// `txn_` + UUIDv7: millisecond timestamp plus 74 random bits
pub fn new_transaction_id() -> String {
    format!("txn_{}", Uuid::now_v7().simple())
}
