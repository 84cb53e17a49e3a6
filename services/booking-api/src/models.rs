use booking_core::types::{NewSlot, PaymentStatus, SessionType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Create availability slot request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateSlotRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[validate(range(min = 1, max = 500))]
    pub capacity: u32,
    pub price: Decimal,
    #[serde(default)]
    pub session_type: SessionType,
}

impl From<CreateSlotRequest> for NewSlot {
    fn from(request: CreateSlotRequest) -> Self {
        NewSlot {
            start: request.start,
            end: request.end,
            capacity: request.capacity,
            price: request.price,
            session_type: request.session_type,
        }
    }
}

/// Create booking request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateBookingRequest {
    pub slot_id: Uuid,
    pub nurse_id: Uuid,
}

/// Cancel booking request (body optional)
#[derive(Debug, Default, Deserialize, Serialize, Validate)]
pub struct CancelBookingRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Initiate payment request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct InitiatePaymentRequest {
    pub booking_id: Uuid,
    pub amount: Decimal,
    #[validate(length(min = 1, max = 64))]
    pub gateway: String,
}

/// Gateway outcome webhook
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct PaymentOutcomeRequest {
    pub status: PaymentStatus,
}

/// Booking with its payments and session, as returned by `GET /bookings/{id}`
#[derive(Debug, Serialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: booking_core::Booking,
    pub payments: Vec<booking_core::PaymentRecord>,
    pub session: Option<booking_core::SessionRecord>,
}
