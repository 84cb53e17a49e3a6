//! Engine facade
//!
//! Wires the store, slot ledger, state machine, payment ledger, provisioner,
//! dispatcher and sweeper together and exposes the boundary operations used
//! by the HTTP service.

use crate::{
    booking::BookingStateMachine,
    config::Config,
    metrics::Metrics,
    notify::{NotificationDispatcher, Subscriber},
    payments::{OutcomeReport, PaymentLedger},
    sessions::{SessionProvisioner, VideoProvider},
    slots::SlotLedger,
    store::{MemoryStore, Store},
    sweeper::{ExpirySweeper, SweepReport},
    types::{
        AvailabilitySlot, Booking, BookingState, Gateway, NewSlot, PaymentRecord, PaymentStatus,
        SessionRecord,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Booking coordination engine
#[derive(Debug, Clone)]
pub struct BookingEngine {
    config: Config,
    metrics: Metrics,
    dispatcher: Arc<NotificationDispatcher>,
    slots: SlotLedger,
    bookings: BookingStateMachine,
    payments: PaymentLedger,
    sessions: SessionProvisioner,
    sweeper: Arc<ExpirySweeper>,
}

impl BookingEngine {
    /// Engine over an in-memory store. Must be called inside a Tokio runtime.
    pub fn new(config: Config, provider: Arc<dyn VideoProvider>) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()), provider, Vec::new())
    }

    /// Engine over the given store with initial subscribers
    pub fn with_store(
        config: Config,
        store: Arc<dyn Store>,
        provider: Arc<dyn VideoProvider>,
        subscribers: Vec<Arc<dyn Subscriber>>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let dispatcher = Arc::new(NotificationDispatcher::spawn(
            &config.notifications,
            subscribers,
            metrics.clone(),
        ));

        let slots = SlotLedger::new(store.clone(), metrics.clone());
        let bookings = BookingStateMachine::new(
            store.clone(),
            slots.clone(),
            dispatcher.clone(),
            metrics.clone(),
        );
        let payments = PaymentLedger::new(store.clone(), bookings.clone(), metrics.clone());
        let sessions = SessionProvisioner::new(
            store,
            bookings.clone(),
            provider,
            config.provisioning.clone(),
            metrics.clone(),
        );
        let sweeper = Arc::new(ExpirySweeper::new(
            bookings.clone(),
            payments.clone(),
            slots.clone(),
            sessions.clone(),
            config.expiry.clone(),
            metrics.clone(),
        ));

        info!("Booking engine ready");

        Ok(Self {
            config,
            metrics,
            dispatcher,
            slots,
            bookings,
            payments,
            sessions,
            sweeper,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Engine metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Register a notification subscriber
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        self.dispatcher.add_subscriber(subscriber);
    }

    /// Publish a slot
    pub fn create_slot(&self, mentor_id: Uuid, new_slot: NewSlot) -> Result<AvailabilitySlot> {
        self.slots.create_slot(mentor_id, new_slot)
    }

    /// Get slot by ID
    pub fn slot(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        self.slots.slot(slot_id)
    }

    /// Slots of a mentor
    pub fn slots_for_mentor(&self, mentor_id: Uuid) -> Result<Vec<AvailabilitySlot>> {
        self.slots.slots_for_mentor(mentor_id)
    }

    /// Stop new reservations on a slot
    pub fn withdraw_slot(&self, slot_id: Uuid) -> Result<AvailabilitySlot> {
        self.slots.withdraw(slot_id)
    }

    /// Reserve a unit and create a `pending` booking
    pub fn create_booking(&self, slot_id: Uuid, nurse_id: Uuid) -> Result<Booking> {
        self.bookings.create(slot_id, nurse_id)
    }

    /// Read a booking, repairing it first if a recorded payment outcome did not land
    pub fn booking(&self, booking_id: Uuid) -> Result<Booking> {
        self.payments.reconcile(booking_id)
    }

    /// Bookings of a nurse
    pub fn bookings_for_nurse(&self, nurse_id: Uuid) -> Result<Vec<Booking>> {
        self.bookings.bookings_for_nurse(nurse_id)
    }

    /// Cancel a `pending` booking, releasing its unit before returning
    pub fn cancel_booking(&self, booking_id: Uuid, reason: Option<&str>) -> Result<Booking> {
        Ok(self.bookings.cancel(booking_id, reason)?.into_booking())
    }

    /// Explicit completion signal; closes the session too
    pub fn complete_booking(&self, booking_id: Uuid) -> Result<Booking> {
        let booking = self.bookings.complete(booking_id)?.into_booking();
        self.sessions.finish_session(booking_id)?;
        Ok(booking)
    }

    /// Start a payment attempt
    pub fn initiate_payment(
        &self,
        booking_id: Uuid,
        amount: Decimal,
        gateway: Gateway,
    ) -> Result<PaymentRecord> {
        self.payments.initiate(booking_id, amount, gateway)
    }

    /// Gateway outcome callback. A completion that moves the booking to
    /// `paid` starts provisioning in the background; the sweeper retries it if
    /// that gives up.
    pub fn report_payment_outcome(
        &self,
        transaction_id: &str,
        status: PaymentStatus,
    ) -> Result<OutcomeReport> {
        let report = self.payments.report_outcome(transaction_id, status)?;

        if self.config.provisioning.provision_on_payment
            && !report.replayed
            && report.booking.state == BookingState::Paid
        {
            self.spawn_provisioning(report.booking.booking_id);
        }

        Ok(report)
    }

    /// Get payment by transaction ID
    pub fn payment(&self, transaction_id: &str) -> Result<PaymentRecord> {
        self.payments.payment(transaction_id)
    }

    /// Payment attempts of a booking
    pub fn payments_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentRecord>> {
        self.payments.payments_for_booking(booking_id)
    }

    /// Provision the session of a paid booking, retrying provider outages
    pub async fn provision_session(&self, booking_id: Uuid) -> Result<SessionRecord> {
        self.sessions.provision_with_retry(booking_id).await
    }

    /// Session of a booking
    pub fn session(&self, booking_id: Uuid) -> Result<SessionRecord> {
        self.sessions.session(booking_id)
    }

    /// Move a session one status forward
    pub fn advance_session(&self, session_id: Uuid) -> Result<SessionRecord> {
        self.sessions.advance_session(session_id)
    }

    /// Run one sweep pass now
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweeper.sweep_once(now).await
    }

    /// Spawn the background sweeper unless disabled in config
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.expiry.enabled {
            info!("Expiry sweeper disabled");
            return None;
        }
        Some(tokio::spawn(self.sweeper.clone().run(shutdown)))
    }

    fn spawn_provisioning(&self, booking_id: Uuid) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(%booking_id, "No runtime to provision on; left to the sweeper");
                return;
            }
        };

        let sessions = self.sessions.clone();
        handle.spawn(async move {
            if let Err(e) = sessions.provision_with_retry(booking_id).await {
                warn!(%booking_id, "Provisioning after payment failed, sweeper will retry: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelSubscriber;
    use crate::sessions::LoopbackProvider;
    use crate::sessions::{Meeting, MeetingRequest, ProviderError};
    use crate::types::{EventType, SessionType};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Engine that only provisions when asked
    fn engine() -> BookingEngine {
        let mut config = Config::default();
        config.provisioning.provision_on_payment = false;
        BookingEngine::new(config, Arc::new(LoopbackProvider::default())).unwrap()
    }

    /// Fails the first call, then behaves like the loopback provider
    #[derive(Default)]
    struct FailsOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl VideoProvider for FailsOnce {
        fn name(&self) -> &str {
            "fails-once"
        }

        async fn create_meeting(
            &self,
            request: &MeetingRequest,
        ) -> std::result::Result<Meeting, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ProviderError::Unavailable("connection reset".into()));
            }
            LoopbackProvider::default().create_meeting(request).await
        }
    }

    fn new_slot(capacity: u32) -> NewSlot {
        let start = Utc::now() + Duration::hours(3);
        NewSlot {
            start,
            end: start + Duration::hours(1),
            capacity,
            price: Decimal::new(4000, 2),
            session_type: SessionType::Video,
        }
    }

    #[tokio::test]
    async fn test_happy_path_through_engine() {
        let engine = engine();
        let (subscriber, mut rx) = ChannelSubscriber::new("test");
        engine.add_subscriber(Arc::new(subscriber));

        let slot = engine.create_slot(Uuid::now_v7(), new_slot(2)).unwrap();
        let booking = engine.create_booking(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = engine
            .initiate_payment(booking.booking_id, booking.amount, Gateway::new("stripe"))
            .unwrap();
        engine
            .report_payment_outcome(&payment.transaction_id, PaymentStatus::Completed)
            .unwrap();
        let session = engine.provision_session(booking.booking_id).await.unwrap();
        let completed = engine.complete_booking(booking.booking_id).unwrap();

        assert_eq!(completed.state, BookingState::Completed);
        assert_eq!(completed.session_id, Some(session.session_id));

        let mut types = Vec::new();
        for _ in 0..4 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            types.push(event.event_type);
        }
        assert_eq!(
            types,
            vec![
                EventType::BookingCreated,
                EventType::PaymentCompleted,
                EventType::BookingConfirmed,
                EventType::BookingCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_paid_booking_cannot_be_cancelled_directly() {
        let engine = engine();
        let slot = engine.create_slot(Uuid::now_v7(), new_slot(1)).unwrap();
        let booking = engine.create_booking(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = engine
            .initiate_payment(booking.booking_id, booking.amount, Gateway::new("stripe"))
            .unwrap();
        engine
            .report_payment_outcome(&payment.transaction_id, PaymentStatus::Completed)
            .unwrap();

        assert!(matches!(
            engine.cancel_booking(booking.booking_id, None),
            Err(Error::InvalidTransition { .. })
        ));

        // Refund confirmation is the way out of `paid`
        let report = engine
            .report_payment_outcome(&payment.transaction_id, PaymentStatus::Refunded)
            .unwrap();
        assert_eq!(report.booking.state, BookingState::Cancelled);
        assert_eq!(engine.slot(slot.slot_id).unwrap().reserved_count, 0);
    }

    #[tokio::test]
    async fn test_completed_payment_provisions_without_client_call() {
        let mut config = Config::default();
        config.provisioning.initial_backoff_ms = 1;
        let provider = Arc::new(FailsOnce::default());
        let engine = BookingEngine::new(config, provider.clone()).unwrap();

        let slot = engine.create_slot(Uuid::now_v7(), new_slot(1)).unwrap();
        let booking = engine.create_booking(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = engine
            .initiate_payment(booking.booking_id, booking.amount, Gateway::new("stripe"))
            .unwrap();
        let report = engine
            .report_payment_outcome(&payment.transaction_id, PaymentStatus::Completed)
            .unwrap();
        assert_eq!(report.booking.state, BookingState::Paid);

        let confirmed = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let current = engine.booking(booking.booking_id).unwrap();
                if current.state == BookingState::Confirmed {
                    return current;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            confirmed.session_id,
            Some(engine.session(booking.booking_id).unwrap().session_id)
        );
    }

    #[tokio::test]
    async fn test_spawn_sweeper_respects_enabled_flag() {
        let mut config = Config::default();
        config.expiry.enabled = false;
        let engine =
            BookingEngine::new(config, Arc::new(LoopbackProvider::default())).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(engine.spawn_sweeper(rx).is_none());

        let engine = self::engine();
        let (tx, rx) = watch::channel(false);
        let handle = engine.spawn_sweeper(rx).unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
