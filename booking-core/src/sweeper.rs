//! Periodic expiry sweep
//!
//! Each pass:
//! 1. expires `pending` bookings older than the payment window, after first
//!    reconciling them against recorded payment outcomes
//! 2. retries provisioning for `paid` bookings whose slot has not ended
//! 3. completes `confirmed` bookings whose slot has ended
//! 4. deactivates elapsed slots
//! 5. re-releases holds of terminal bookings whose release did not land
//!
//! Every step goes through the same conditional transitions as the request
//! path, so a pass may run concurrently with payment callbacks. Losing a race
//! is counted, not reported as an error.

use crate::{
    booking::{BookingStateMachine, Outcome},
    config::ExpiryConfig,
    metrics::Metrics,
    payments::PaymentLedger,
    sessions::SessionProvisioner,
    slots::SlotLedger,
    types::BookingState,
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Pending bookings moved to `expired`
    pub expired: usize,
    /// Pending bookings advanced from a recorded payment outcome instead
    pub reconciled: usize,
    /// Expiries that lost to a concurrent transition
    pub lost_races: usize,
    /// Paid bookings confirmed by a provisioning retry
    pub provisioned: usize,
    /// Confirmed bookings moved to `completed`
    pub completed: usize,
    /// Slots deactivated
    pub slots_deactivated: usize,
    /// Holds released on behalf of terminal bookings
    pub holds_repaired: usize,
    /// Per-booking failures (the pass continues past them)
    pub errors: usize,
}

impl SweepReport {
    /// Whether the pass changed anything
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Background expiry sweeper
#[derive(Debug, Clone)]
pub struct ExpirySweeper {
    bookings: BookingStateMachine,
    payments: PaymentLedger,
    slots: SlotLedger,
    sessions: SessionProvisioner,
    config: ExpiryConfig,
    metrics: Metrics,
}

impl ExpirySweeper {
    /// Create new sweeper
    pub fn new(
        bookings: BookingStateMachine,
        payments: PaymentLedger,
        slots: SlotLedger,
        sessions: SessionProvisioner,
        config: ExpiryConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            bookings,
            payments,
            slots,
            sessions,
            config,
            metrics,
        }
    }

    /// Run passes every `sweep_interval` until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting expiry sweeper (interval {:?}, payment window {}s)",
            self.config.sweep_interval(),
            self.config.payment_window_secs
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if !report.is_empty() => info!(?report, "Sweep finished"),
                        Ok(_) => debug!("Sweep found nothing to do"),
                        Err(e) => warn!("Sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// One pass evaluated at `now`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        self.expire_stale(now, &mut report)?;
        self.provision_paid(now, &mut report).await?;
        self.complete_elapsed(now, &mut report)?;

        report.slots_deactivated = self.slots.deactivate_elapsed(now)?.len();
        self.metrics
            .sweep_actions
            .with_label_values(&["slot_deactivated"])
            .inc_by(report.slots_deactivated as u64);

        self.repair_holds(&mut report)?;

        Ok(report)
    }

    fn expire_stale(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let cutoff = now - self.config.payment_window();

        for booking in self.bookings.bookings_in_state(BookingState::Pending)? {
            if booking.created_at > cutoff {
                continue;
            }
            let booking_id = booking.booking_id;

            // An outcome may have been recorded without reaching the booking
            match self.payments.reconcile(booking_id) {
                Ok(current) if current.state != BookingState::Pending => {
                    report.reconciled += 1;
                    self.metrics.record_sweep_action("reconciled");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%booking_id, "Reconcile before expiry failed: {}", e);
                    report.errors += 1;
                    continue;
                }
            }

            match self.bookings.expire(booking_id) {
                Ok(Outcome::Applied { .. }) => {
                    report.expired += 1;
                    self.metrics.record_sweep_action("expired");
                }
                Ok(Outcome::Unchanged(_)) => {}
                Err(Error::InvalidTransition { from, .. }) => {
                    debug!(%booking_id, state = %from, "Expiry lost to concurrent transition");
                    report.lost_races += 1;
                    self.metrics.record_sweep_action("lost_race");
                }
                Err(e) => {
                    warn!(%booking_id, "Failed to expire booking: {}", e);
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    async fn provision_paid(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for booking in self.bookings.bookings_in_state(BookingState::Paid)? {
            let booking_id = booking.booking_id;
            match self.slots.slot(booking.slot_id) {
                Ok(slot) if slot.is_elapsed(now) => {
                    debug!(%booking_id, "Slot ended before a session was provisioned");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%booking_id, "Slot lookup failed: {}", e);
                    report.errors += 1;
                    continue;
                }
            }

            // One attempt per pass; the next pass is the backoff
            match self.sessions.provision(booking_id).await {
                Ok(session) => {
                    info!(%booking_id, session_id = %session.session_id, "Provisioning retry succeeded");
                    report.provisioned += 1;
                    self.metrics.record_sweep_action("provision_retry");
                }
                Err(Error::InvalidTransition { from, .. }) => {
                    debug!(%booking_id, state = %from, "Booking left paid before provisioning");
                }
                Err(e) => {
                    warn!(%booking_id, "Provisioning retry failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    fn complete_elapsed(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for booking in self.bookings.bookings_in_state(BookingState::Confirmed)? {
            let booking_id = booking.booking_id;
            let slot = match self.slots.slot(booking.slot_id) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(%booking_id, "Slot lookup failed: {}", e);
                    report.errors += 1;
                    continue;
                }
            };
            if !slot.is_elapsed(now) {
                continue;
            }

            match self.bookings.complete(booking_id) {
                Ok(Outcome::Applied { .. }) => {
                    report.completed += 1;
                    self.metrics.record_sweep_action("completed");
                }
                Ok(Outcome::Unchanged(_)) | Err(Error::InvalidTransition { .. }) => continue,
                Err(e) => {
                    warn!(%booking_id, "Failed to complete booking: {}", e);
                    report.errors += 1;
                    continue;
                }
            }

            if let Err(e) = self.sessions.finish_session(booking_id) {
                warn!(%booking_id, "Failed to close session: {}", e);
                report.errors += 1;
            }
        }

        Ok(())
    }

    fn repair_holds(&self, report: &mut SweepReport) -> Result<()> {
        for state in [
            BookingState::PaymentFailed,
            BookingState::Cancelled,
            BookingState::Expired,
        ] {
            for booking in self.bookings.bookings_in_state(state)? {
                match self.bookings.ensure_released(&booking) {
                    Ok(true) => {
                        info!(booking_id = %booking.booking_id, "Released leftover hold");
                        report.holds_repaired += 1;
                        self.metrics.record_sweep_action("hold_repaired");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(booking_id = %booking.booking_id, "Hold repair failed: {}", e);
                        report.errors += 1;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisioningConfig;
    use crate::notify::RecordingNotifier;
    use crate::sessions::{LoopbackProvider, Meeting, MeetingRequest, ProviderError, VideoProvider};
    use crate::store::{MemoryStore, Store};
    use crate::types::{
        AvailabilitySlot, EventType, Gateway, HoldState, NewSlot, PaymentRecord, PaymentStatus,
        SessionStatus, SessionType,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    /// Provider that is down until switched back on
    #[derive(Default)]
    struct OutageProvider {
        up: AtomicBool,
    }

    #[async_trait]
    impl VideoProvider for OutageProvider {
        fn name(&self) -> &str {
            "outage"
        }

        async fn create_meeting(
            &self,
            request: &MeetingRequest,
        ) -> std::result::Result<Meeting, ProviderError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("503".into()));
            }
            Ok(Meeting {
                join_url: format!("https://video.test/{}", request.booking_id),
                provider_ref: None,
            })
        }
    }

    struct Fixture {
        store: Arc<dyn Store>,
        slots: SlotLedger,
        bookings: BookingStateMachine,
        payments: PaymentLedger,
        sessions: SessionProvisioner,
        notifier: Arc<RecordingNotifier>,
        sweeper: ExpirySweeper,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(LoopbackProvider::default()))
    }

    fn fixture_with(provider: Arc<dyn VideoProvider>) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let metrics = Metrics::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let slots = SlotLedger::new(store.clone(), metrics.clone());
        let bookings =
            BookingStateMachine::new(store.clone(), slots.clone(), notifier.clone(), metrics.clone());
        let payments = PaymentLedger::new(store.clone(), bookings.clone(), metrics.clone());
        let sessions = SessionProvisioner::new(
            store.clone(),
            bookings.clone(),
            provider,
            ProvisioningConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..ProvisioningConfig::default()
            },
            metrics.clone(),
        );
        let sweeper = ExpirySweeper::new(
            bookings.clone(),
            payments.clone(),
            slots.clone(),
            sessions.clone(),
            ExpiryConfig::default(),
            metrics,
        );
        Fixture {
            store,
            slots,
            bookings,
            payments,
            sessions,
            notifier,
            sweeper,
        }
    }

    fn slot(f: &Fixture, capacity: u32) -> AvailabilitySlot {
        let start = Utc::now() + Duration::hours(1);
        f.slots
            .create_slot(
                Uuid::now_v7(),
                NewSlot {
                    start,
                    end: start + Duration::minutes(30),
                    capacity,
                    price: Decimal::new(1500, 2),
                    session_type: SessionType::Video,
                },
            )
            .unwrap()
    }

    fn past_window() -> DateTime<Utc> {
        Utc::now() + ExpiryConfig::default().payment_window() + Duration::seconds(1)
    }

    #[tokio::test]
    async fn test_expires_stale_pending_and_frees_capacity() {
        let f = fixture();
        let slot = slot(&f, 1);
        let booking = f.bookings.create(slot.slot_id, Uuid::now_v7()).unwrap();

        // Inside the window nothing happens
        let report = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.expired, 0);

        let report = f.sweeper.sweep_once(past_window()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(
            f.bookings.booking(booking.booking_id).unwrap().state,
            BookingState::Expired
        );
        assert_eq!(f.slots.slot(slot.slot_id).unwrap().reserved_count, 0);

        let events = f.notifier.events_for(booking.booking_id);
        assert_eq!(events.last().unwrap().event_type, EventType::BookingExpired);

        // Second pass is a no-op
        let report = f.sweeper.sweep_once(past_window()).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(f.notifier.events_for(booking.booking_id).len(), events.len());
    }

    #[tokio::test]
    async fn test_reconciles_recorded_completion_instead_of_expiring() {
        let f = fixture();
        let slot = slot(&f, 1);
        let booking = f.bookings.create(slot.slot_id, Uuid::now_v7()).unwrap();

        // Outcome recorded, booking update never landed
        let now = Utc::now();
        let payment = PaymentRecord {
            payment_id: Uuid::now_v7(),
            booking_id: booking.booking_id,
            amount: booking.amount,
            gateway: Gateway::new("stripe"),
            transaction_id: "txn_lost_update".to_string(),
            status: PaymentStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        f.store.insert_payment(payment.clone()).unwrap();
        f.store
            .claim_completion(booking.booking_id, &payment.transaction_id)
            .unwrap();

        let report = f.sweeper.sweep_once(past_window()).await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.expired, 0);
        // Same pass goes on to provision the now paid booking
        assert_eq!(report.provisioned, 1);

        let booking = f.bookings.booking(booking.booking_id).unwrap();
        assert_eq!(booking.state, BookingState::Confirmed);
        assert_eq!(booking.payment_id, Some(payment.payment_id));
        assert_eq!(f.slots.slot(slot.slot_id).unwrap().reserved_count, 1);
    }

    #[tokio::test]
    async fn test_completes_confirmed_booking_after_slot_end() {
        let f = fixture();
        let slot = slot(&f, 1);
        let booking = f.bookings.create(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = f
            .payments
            .initiate(booking.booking_id, booking.amount, Gateway::new("paypal"))
            .unwrap();
        f.payments
            .report_outcome(&payment.transaction_id, PaymentStatus::Completed)
            .unwrap();

        f.sessions.provision(booking.booking_id).await.unwrap();

        let report = f.sweeper.sweep_once(slot.end + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.slots_deactivated, 1);

        assert_eq!(
            f.bookings.booking(booking.booking_id).unwrap().state,
            BookingState::Completed
        );
        assert_eq!(
            f.sessions.session(booking.booking_id).unwrap().status,
            SessionStatus::Completed
        );
        // Completed bookings keep their unit
        assert_eq!(f.slots.slot(slot.slot_id).unwrap().reserved_count, 1);
    }

    #[tokio::test]
    async fn test_repairs_hold_left_by_failed_release() {
        let f = fixture();
        let slot = slot(&f, 1);
        let booking = f.bookings.create(slot.slot_id, Uuid::now_v7()).unwrap();

        // Simulate a transition that committed without releasing
        f.store
            .update_booking(booking.booking_id, &mut |booking| {
                booking.state = BookingState::Cancelled;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            f.store.hold_state(booking.reservation_id).unwrap(),
            Some(HoldState::Held)
        );

        let report = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.holds_repaired, 1);
        assert_eq!(f.slots.slot(slot.slot_id).unwrap().reserved_count, 0);

        let report = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.holds_repaired, 0);
    }

    #[tokio::test]
    async fn test_retries_provisioning_after_provider_recovers() {
        let provider = Arc::new(OutageProvider::default());
        let f = fixture_with(provider.clone());
        let slot = slot(&f, 1);
        let booking = f.bookings.create(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = f
            .payments
            .initiate(booking.booking_id, booking.amount, Gateway::new("stripe"))
            .unwrap();
        f.payments
            .report_outcome(&payment.transaction_id, PaymentStatus::Completed)
            .unwrap();

        // Caller-side retries run out while the provider is down
        assert!(matches!(
            f.sessions.provision_with_retry(booking.booking_id).await,
            Err(Error::ProviderUnavailable(_))
        ));
        let report = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.provisioned, 0);
        assert_eq!(report.errors, 1);
        assert_eq!(
            f.bookings.booking(booking.booking_id).unwrap().state,
            BookingState::Paid
        );

        provider.up.store(true, Ordering::SeqCst);
        let report = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.provisioned, 1);

        let confirmed = f.bookings.booking(booking.booking_id).unwrap();
        assert_eq!(confirmed.state, BookingState::Confirmed);
        assert_eq!(
            confirmed.session_id,
            Some(f.sessions.session(booking.booking_id).unwrap().session_id)
        );

        // Nothing left to retry
        let report = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.provisioned, 0);
    }

    #[tokio::test]
    async fn test_paid_booking_with_ended_slot_is_not_provisioned() {
        let f = fixture();
        let slot = slot(&f, 1);
        let booking = f.bookings.create(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = f
            .payments
            .initiate(booking.booking_id, booking.amount, Gateway::new("stripe"))
            .unwrap();
        f.payments
            .report_outcome(&payment.transaction_id, PaymentStatus::Completed)
            .unwrap();

        let report = f.sweeper.sweep_once(slot.end + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.provisioned, 0);
        assert_eq!(report.errors, 0);
        assert_eq!(
            f.bookings.booking(booking.booking_id).unwrap().state,
            BookingState::Paid
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(f.sweeper.clone()).run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
