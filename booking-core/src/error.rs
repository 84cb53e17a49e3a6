//! Error types for the booking engine

use crate::types::{BookingState, PaymentStatus};
use thiserror::Error;
use uuid::Uuid;

/// Result type for booking operations
pub type Result<T> = std::result::Result<T, Error>;

/// Booking engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Slot has no free capacity left
    #[error("Slot is full: {0}")]
    SlotFull(Uuid),

    /// Slot was withdrawn or has elapsed
    #[error("Slot is inactive: {0}")]
    SlotInactive(Uuid),

    /// Slot not found
    #[error("Slot not found: {0}")]
    SlotNotFound(Uuid),

    /// Booking not found
    #[error("Booking not found: {0}")]
    BookingNotFound(Uuid),

    /// Payment not found (by transaction id)
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// Transition not in the booking transition table
    #[error("Invalid transition: cannot {action} a booking in state {from}")]
    InvalidTransition {
        /// State the booking was in
        from: BookingState,
        /// Action that was attempted
        action: &'static str,
    },

    /// Gateway reported a different terminal outcome than the one recorded
    #[error("Conflicting outcome for {transaction_id}: recorded {recorded}, reported {reported}")]
    ConflictingOutcome {
        /// Transaction id
        transaction_id: String,
        /// Status already recorded
        recorded: PaymentStatus,
        /// Status that was reported
        reported: PaymentStatus,
    },

    /// Transaction id already present in the ledger
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    /// Booking already has a different completed payment
    #[error("Booking {booking_id} already paid by {transaction_id}")]
    AlreadyPaid {
        /// Booking id
        booking_id: Uuid,
        /// Transaction that completed first
        transaction_id: String,
    },

    /// Payment amount does not match booking amount
    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch {
        /// Booking amount
        expected: rust_decimal::Decimal,
        /// Amount offered
        actual: rust_decimal::Decimal,
    },

    /// Video provider unreachable, timed out or failing (retryable)
    #[error("Session provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Schedule cannot be provisioned (not retryable)
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Input validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Concurrency error (worker gone, lock poisoned, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable(_) | Error::Storage(_) | Error::Concurrency(_)
        )
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SlotFull(_) => "slot_full",
            Error::SlotInactive(_) => "slot_inactive",
            Error::SlotNotFound(_) => "slot_not_found",
            Error::BookingNotFound(_) => "booking_not_found",
            Error::PaymentNotFound(_) => "payment_not_found",
            Error::SessionNotFound(_) => "session_not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::ConflictingOutcome { .. } => "conflicting_outcome",
            Error::DuplicateTransaction(_) => "duplicate_transaction",
            Error::AlreadyPaid { .. } => "already_paid",
            Error::AmountMismatch { .. } => "amount_mismatch",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::InvalidSchedule(_) => "invalid_schedule",
            Error::Validation(_) => "validation_error",
            Error::Storage(_) => "storage_error",
            Error::Concurrency(_) => "concurrency_error",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
        }
    }
}
