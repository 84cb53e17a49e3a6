//! Core types for the booking engine
//!
//! Records are plain serde structs; all mutation goes through the component
//! that owns the record (slots through the slot ledger, bookings through the
//! state machine, payments through the payment ledger).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of session a slot offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Video call
    Video,
    /// Audio-only call
    Audio,
}

impl Default for SessionType {
    fn default() -> Self {
        SessionType::Video
    }
}

/// Mentor-published, capacity-bounded availability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    /// Slot ID
    pub slot_id: Uuid,

    /// Owning mentor
    pub mentor_id: Uuid,

    /// Session start
    pub start: DateTime<Utc>,

    /// Session end
    pub end: DateTime<Utc>,

    /// Max concurrent bookings
    pub capacity: u32,

    /// Units currently held by bookings
    pub reserved_count: u32,

    /// Price per booking
    pub price: Decimal,

    /// Session type
    pub session_type: SessionType,

    /// Accepting reservations
    pub active: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl AvailabilitySlot {
    /// Units still available
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.reserved_count)
    }

    /// Whether the slot end has passed
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    /// Scheduled length in seconds
    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// Slot creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSlot {
    /// Session start
    pub start: DateTime<Utc>,
    /// Session end
    pub end: DateTime<Utc>,
    /// Max concurrent bookings
    pub capacity: u32,
    /// Price per booking
    pub price: Decimal,
    /// Session type
    #[serde(default)]
    pub session_type: SessionType,
}

/// Proof of one reserved unit of slot capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHandle {
    /// Reservation ID (one per booking)
    pub reservation_id: Uuid,
    /// Slot the unit belongs to
    pub slot_id: Uuid,
    /// When the unit was taken
    pub reserved_at: DateTime<Utc>,
}

/// Hold record backing a reservation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    /// Unit is counted in the slot's reserved_count
    Held,
    /// Unit was given back
    Released,
}

/// Booking lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    /// Slot reserved, awaiting payment
    Pending,
    /// Payment completed, awaiting session
    Paid,
    /// Session provisioned
    Confirmed,
    /// Session occurred (terminal)
    Completed,
    /// Payment failed (terminal)
    PaymentFailed,
    /// Cancelled (terminal)
    Cancelled,
    /// No payment within the window (terminal)
    Expired,
}

impl BookingState {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingState::Pending => "pending",
            BookingState::Paid => "paid",
            BookingState::Confirmed => "confirmed",
            BookingState::Completed => "completed",
            BookingState::PaymentFailed => "payment_failed",
            BookingState::Cancelled => "cancelled",
            BookingState::Expired => "expired",
        }
    }

    /// No outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingState::Completed
                | BookingState::PaymentFailed
                | BookingState::Cancelled
                | BookingState::Expired
        )
    }

    /// Entering this state gives the slot unit back
    pub fn releases_capacity(&self) -> bool {
        matches!(
            self,
            BookingState::PaymentFailed | BookingState::Cancelled | BookingState::Expired
        )
    }

    /// Transition table. Anything not listed is rejected and leaves state unchanged.
    pub fn on(self, action: BookingAction) -> crate::Result<BookingState> {
        use BookingAction as A;
        use BookingState as S;

        let next = match (self, action) {
            (S::Pending, A::PaymentCompleted) => S::Paid,
            (S::Pending, A::PaymentFailed) => S::PaymentFailed,
            (S::Pending, A::Cancel) => S::Cancelled,
            (S::Pending, A::Expire) => S::Expired,
            (S::Paid, A::SessionProvisioned) => S::Confirmed,
            (S::Paid, A::RefundConfirmed) => S::Cancelled,
            (S::Confirmed, A::Complete) => S::Completed,
            (from, action) => {
                return Err(crate::Error::InvalidTransition {
                    from,
                    action: action.name(),
                })
            }
        };

        Ok(next)
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the booking transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingAction {
    /// Gateway reported a completed payment
    PaymentCompleted,
    /// Gateway reported a failed payment
    PaymentFailed,
    /// Nurse or operator cancelled before payment
    Cancel,
    /// Payment window elapsed
    Expire,
    /// Video session created
    SessionProvisioned,
    /// Session took place
    Complete,
    /// Refund confirmed by the gateway
    RefundConfirmed,
}

impl BookingAction {
    /// Verb used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            BookingAction::PaymentCompleted => "pay",
            BookingAction::PaymentFailed => "fail payment for",
            BookingAction::Cancel => "cancel",
            BookingAction::Expire => "expire",
            BookingAction::SessionProvisioned => "confirm",
            BookingAction::Complete => "complete",
            BookingAction::RefundConfirmed => "refund",
        }
    }

    /// Event emitted when this action is accepted
    pub fn event_type(&self) -> EventType {
        match self {
            BookingAction::PaymentCompleted => EventType::PaymentCompleted,
            BookingAction::PaymentFailed => EventType::PaymentFailed,
            BookingAction::Cancel => EventType::BookingCancelled,
            BookingAction::Expire => EventType::BookingExpired,
            BookingAction::SessionProvisioned => EventType::BookingConfirmed,
            BookingAction::Complete => EventType::BookingCompleted,
            BookingAction::RefundConfirmed => EventType::BookingRefunded,
        }
    }
}

/// A nurse's claim on one unit of a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    /// Booking ID
    pub booking_id: Uuid,

    /// Reserved slot
    pub slot_id: Uuid,

    /// Nurse who booked
    pub nurse_id: Uuid,

    /// Mentor (denormalized from the slot)
    pub mentor_id: Uuid,

    /// Reservation backing this booking
    pub reservation_id: Uuid,

    /// Lifecycle state
    pub state: BookingState,

    /// Amount due
    pub amount: Decimal,

    /// Completed payment (set on entry to paid)
    pub payment_id: Option<Uuid>,

    /// Provisioned session (set on entry to confirmed)
    pub session_id: Option<Uuid>,

    /// Incremented on every accepted transition
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last transition timestamp
    pub updated_at: DateTime<Utc>,

    /// First transition out of pending
    pub decided_at: Option<DateTime<Utc>>,
}

/// Payment record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Initiated, awaiting gateway callback
    Pending,
    /// Captured
    Completed,
    /// Declined or errored
    Failed,
    /// Captured then returned
    Refunded,
}

impl PaymentStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Terminal gateway outcome
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment gateway name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gateway(String);

impl Gateway {
    /// Create new gateway name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attempt to pay for a booking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Payment ID
    pub payment_id: Uuid,

    /// Booking being paid
    pub booking_id: Uuid,

    /// Amount
    pub amount: Decimal,

    /// Gateway used
    pub gateway: Gateway,

    /// Globally unique transaction id handed to the gateway
    pub transaction_id: String,

    /// Current status
    pub status: PaymentStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last outcome timestamp
    pub updated_at: DateTime<Utc>,
}

/// Provisioned session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Link issued, not started
    Scheduled,
    /// In progress
    Active,
    /// Over
    Completed,
}

impl SessionStatus {
    /// Next status, if any
    pub fn next(&self) -> Option<SessionStatus> {
        match self {
            SessionStatus::Scheduled => Some(SessionStatus::Active),
            SessionStatus::Active => Some(SessionStatus::Completed),
            SessionStatus::Completed => None,
        }
    }
}

/// The provisioned meeting for a booking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session ID
    pub session_id: Uuid,

    /// Booking served
    pub booking_id: Uuid,

    /// Join link issued by the provider
    pub join_url: String,

    /// Scheduled start
    pub scheduled_time: DateTime<Utc>,

    /// Scheduled length in seconds
    pub duration_secs: i64,

    /// Status
    pub status: SessionStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Notification event type, one per transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Booking created in pending
    BookingCreated,
    /// pending -> paid
    PaymentCompleted,
    /// pending -> payment_failed
    PaymentFailed,
    /// pending -> cancelled
    BookingCancelled,
    /// pending -> expired
    BookingExpired,
    /// paid -> confirmed
    BookingConfirmed,
    /// confirmed -> completed
    BookingCompleted,
    /// paid -> cancelled through refund
    BookingRefunded,
}

impl EventType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BookingCreated => "booking_created",
            EventType::PaymentCompleted => "payment_completed",
            EventType::PaymentFailed => "payment_failed",
            EventType::BookingCancelled => "booking_cancelled",
            EventType::BookingExpired => "booking_expired",
            EventType::BookingConfirmed => "booking_confirmed",
            EventType::BookingCompleted => "booking_completed",
            EventType::BookingRefunded => "booking_refunded",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable fact describing an accepted booking transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Event ID (UUIDv7 for time-ordering)
    pub event_id: Uuid,

    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Booking the transition belongs to
    pub booking_id: Uuid,

    /// Mentor
    pub mentor_id: Uuid,

    /// Nurse
    pub nurse_id: Uuid,

    /// Slot
    pub slot_id: Uuid,

    /// Booking version after the transition
    pub sequence: u64,

    /// Transition timestamp
    pub timestamp: DateTime<Utc>,

    /// Transition-specific details
    pub payload: serde_json::Value,
}

impl NotificationEvent {
    /// Build the event for a booking that just reached its current version
    pub fn for_booking(
        event_type: EventType,
        booking: &Booking,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            booking_id: booking.booking_id,
            mentor_id: booking.mentor_id,
            nurse_id: booking.nurse_id,
            slot_id: booking.slot_id,
            sequence: booking.version,
            timestamp: booking.updated_at,
            payload,
        }
    }
}
