//! Video session provisioning
//!
//! Turns a `paid` booking into a joinable session through an external
//! [`VideoProvider`]. Each provider call is bounded by a timeout; a timeout or
//! transport failure surfaces as [`Error::ProviderUnavailable`] and is retried
//! by [`SessionProvisioner::provision_with_retry`] with exponential backoff. A
//! rejected request is an [`Error::InvalidSchedule`] and is never retried.
//!
//! Provisioning is idempotent per booking: concurrent calls for one booking
//! are serialized and a booking that already has a session gets it back.

use crate::{
    booking::BookingStateMachine,
    config::ProvisioningConfig,
    metrics::Metrics,
    store::Store,
    types::{BookingState, SessionRecord, SessionStatus, SessionType},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Meeting creation request sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRequest {
    /// Booking the meeting serves (idempotency key for the provider)
    pub booking_id: Uuid,
    /// Host
    pub mentor_id: Uuid,
    /// Attendee
    pub nurse_id: Uuid,
    /// Scheduled start
    pub start: DateTime<Utc>,
    /// Scheduled length in seconds
    pub duration_secs: i64,
    /// Session type
    pub session_type: SessionType,
}

/// Meeting created by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    /// Join link
    pub join_url: String,
    /// Provider-side reference
    #[serde(default)]
    pub provider_ref: Option<String>,
}

/// Provider failure classes
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network error, 5xx, overload (retryable)
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Provider refused the request (not retryable)
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// External meeting scheduling capability
#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Create a meeting and return its join link
    async fn create_meeting(
        &self,
        request: &MeetingRequest,
    ) -> std::result::Result<Meeting, ProviderError>;
}

/// Provider issuing deterministic local links (development, tests)
#[derive(Debug, Clone)]
pub struct LoopbackProvider {
    base_url: String,
}

impl LoopbackProvider {
    /// Create provider issuing links under `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new("https://meet.localhost/room")
    }
}

#[async_trait]
impl VideoProvider for LoopbackProvider {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn create_meeting(
        &self,
        request: &MeetingRequest,
    ) -> std::result::Result<Meeting, ProviderError> {
        Ok(Meeting {
            join_url: format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                request.booking_id.simple()
            ),
            provider_ref: None,
        })
    }
}

/// Turns paid bookings into sessions
#[derive(Clone)]
pub struct SessionProvisioner {
    store: Arc<dyn Store>,
    bookings: BookingStateMachine,
    provider: Arc<dyn VideoProvider>,
    config: ProvisioningConfig,
    metrics: Metrics,
    in_flight: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionProvisioner {
    /// Create new provisioner
    pub fn new(
        store: Arc<dyn Store>,
        bookings: BookingStateMachine,
        provider: Arc<dyn VideoProvider>,
        config: ProvisioningConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            bookings,
            provider,
            config,
            metrics,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// One bounded provisioning attempt
    pub async fn provision(&self, booking_id: Uuid) -> Result<SessionRecord> {
        let lock = self
            .in_flight
            .entry(booking_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.provision_locked(booking_id).await
        };

        // Only the map and this call hold it: nobody is waiting
        self.in_flight
            .remove_if(&booking_id, |_, entry| Arc::strong_count(entry) <= 2);

        result
    }

    /// Provision, retrying `ProviderUnavailable` with exponential backoff
    pub async fn provision_with_retry(&self, booking_id: Uuid) -> Result<SessionRecord> {
        let mut attempts = 0;
        let mut delay = self.config.initial_backoff();

        loop {
            attempts += 1;

            match self.provision(booking_id).await {
                Ok(session) => {
                    if attempts > 1 {
                        info!(%booking_id, "Session provisioned after {} attempts", attempts);
                    }
                    return Ok(session);
                }
                Err(e) if e.is_retryable() && attempts < self.config.max_attempts => {
                    let wait = with_jitter(delay);
                    warn!(
                        %booking_id,
                        "Provisioning failed (attempt {}), retrying in {:?}: {}",
                        attempts,
                        wait,
                        e
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(self.config.max_backoff());
                }
                Err(e) => {
                    if let Error::InvalidSchedule(reason) = &e {
                        error!(%booking_id, "Session cannot be provisioned, operator action needed: {}", reason);
                    } else {
                        error!(%booking_id, "Provisioning gave up after {} attempts: {}", attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Session of a booking
    pub fn session(&self, booking_id: Uuid) -> Result<SessionRecord> {
        self.store
            .session_for_booking(booking_id)?
            .ok_or(Error::SessionNotFound(booking_id))
    }

    /// Move a session one status forward
    pub fn advance_session(&self, session_id: Uuid) -> Result<SessionRecord> {
        self.store.update_session(session_id, &mut |session| {
            let next = session.status.next().ok_or_else(|| {
                Error::Validation(format!("Session {} is already completed", session_id))
            })?;
            session.status = next;
            Ok(())
        })
    }

    /// Mark the booking's session completed, if it has one
    pub fn finish_session(&self, booking_id: Uuid) -> Result<Option<SessionRecord>> {
        let session = match self.store.session_for_booking(booking_id)? {
            Some(session) => session,
            None => return Ok(None),
        };

        let updated = self.store.update_session(session.session_id, &mut |session| {
            session.status = SessionStatus::Completed;
            Ok(())
        })?;
        Ok(Some(updated))
    }

    async fn provision_locked(&self, booking_id: Uuid) -> Result<SessionRecord> {
        let booking = self.store.get_booking(booking_id)?;

        if let Some(existing) = self.store.session_for_booking(booking_id)? {
            if booking.state == BookingState::Paid {
                // Session stored but confirmation did not land
                self.bookings.confirm(booking_id, &existing)?;
            }
            return Ok(existing);
        }

        if booking.state != BookingState::Paid {
            return Err(Error::InvalidTransition {
                from: booking.state,
                action: "provision a session for",
            });
        }

        let slot = self.store.get_slot(booking.slot_id)?;
        if slot.end <= slot.start {
            return Err(Error::InvalidSchedule(format!(
                "Slot {} ends before it starts",
                slot.slot_id
            )));
        }
        if slot.is_elapsed(Utc::now()) {
            return Err(Error::InvalidSchedule(format!(
                "Slot {} ended at {}",
                slot.slot_id, slot.end
            )));
        }

        let request = MeetingRequest {
            booking_id,
            mentor_id: booking.mentor_id,
            nurse_id: booking.nurse_id,
            start: slot.start,
            duration_secs: slot.duration_secs(),
            session_type: slot.session_type,
        };

        let meeting = self.call_provider(&request).await?;

        let session = SessionRecord {
            session_id: Uuid::now_v7(),
            booking_id,
            join_url: meeting.join_url,
            scheduled_time: slot.start,
            duration_secs: slot.duration_secs(),
            status: SessionStatus::Scheduled,
            created_at: Utc::now(),
        };

        let stored = self.store.insert_session(session)?;
        self.bookings.confirm(booking_id, &stored)?;

        info!(
            %booking_id,
            session_id = %stored.session_id,
            provider = self.provider.name(),
            "Session provisioned"
        );
        Ok(stored)
    }

    async fn call_provider(&self, request: &MeetingRequest) -> Result<Meeting> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.timeout(),
            self.provider.create_meeting(request),
        )
        .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(Ok(meeting)) => {
                self.metrics.record_provision_attempt("ok", elapsed);
                Ok(meeting)
            }
            Ok(Err(ProviderError::Unavailable(reason))) => {
                self.metrics.record_provision_attempt("unavailable", elapsed);
                Err(Error::ProviderUnavailable(reason))
            }
            Ok(Err(ProviderError::Rejected(reason))) => {
                self.metrics.record_provision_attempt("rejected", elapsed);
                Err(Error::InvalidSchedule(reason))
            }
            Err(_) => {
                self.metrics.record_provision_attempt("timeout", elapsed);
                Err(Error::ProviderUnavailable(format!(
                    "{} timed out after {:?}",
                    self.provider.name(),
                    self.config.timeout()
                )))
            }
        }
    }
}

impl std::fmt::Debug for SessionProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProvisioner")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}
