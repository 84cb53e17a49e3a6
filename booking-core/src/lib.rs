//! Booking Coordination Engine
//!
//! Slot capacity accounting, the booking/payment/session lifecycle, and the
//! notification contract triggered by lifecycle transitions.
//!
//! # Architecture
//!
//! - **Conditional updates**: every mutation is a read-check-write under the
//!   record's own lock; different keys never contend
//! - **Explicit state**: one tagged booking state and a transition table
//! - **Single publish point**: one event per accepted transition, emitted from
//!   inside the commit so per-booking order is preserved
//! - **Re-drivable payments**: a recorded outcome that did not reach its
//!   booking is detected and applied on the next read or sweep
//!
//! # Invariants
//!
//! - `0 <= reserved_count <= capacity` for every slot, under concurrent writers
//! - A booking's unit is released exactly once, on entry to
//!   `payment_failed`, `cancelled` or `expired`
//! - Transaction ids are unique; at most one completed payment per booking
//! - Illegal transitions fail and leave state unchanged

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod booking;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod payments;
pub mod sessions;
pub mod slots;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-exports
pub use booking::{BookingStateMachine, Outcome};
pub use config::Config;
pub use engine::BookingEngine;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use notify::{
    ChannelSubscriber, LogSubscriber, NotificationDispatcher, Notifier, RecordingNotifier,
    Subscriber,
};
pub use payments::{OutcomeReport, PaymentLedger};
pub use sessions::{
    LoopbackProvider, Meeting, MeetingRequest, ProviderError, SessionProvisioner, VideoProvider,
};
pub use slots::SlotLedger;
pub use store::{MemoryStore, Store};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use types::{
    AvailabilitySlot, Booking, BookingAction, BookingState, EventType, Gateway, NewSlot,
    NotificationEvent, PaymentRecord, PaymentStatus, ReservationHandle, SessionRecord,
    SessionStatus, SessionType,
};
