use crate::errors::ApiError;
use crate::models::{
    BookingDetails, CancelBookingRequest, CreateBookingRequest, CreateSlotRequest,
    InitiatePaymentRequest, PaymentOutcomeRequest,
};
use actix_web::{web, HttpResponse};
use booking_core::{types::Gateway, BookingEngine};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "booking-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus scrape endpoint
pub async fn metrics(engine: web::Data<BookingEngine>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(engine.metrics().render())
}

/// Publish an availability slot
pub async fn create_slot(
    engine: web::Data<BookingEngine>,
    mentor_id: web::Path<Uuid>,
    request: web::Json<CreateSlotRequest>,
) -> Result<HttpResponse, ApiError> {
    request.validate()?;
    let slot = engine.create_slot(*mentor_id, request.into_inner().into())?;
    Ok(HttpResponse::Created().json(slot))
}

/// List a mentor's slots
pub async fn list_slots(
    engine: web::Data<BookingEngine>,
    mentor_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let slots = engine.slots_for_mentor(*mentor_id)?;

    Ok(HttpResponse::Ok().json(json!({
        "mentor_id": *mentor_id,
        "total_slots": slots.len(),
        "slots": slots
    })))
}

/// Stop new reservations on a slot
pub async fn withdraw_slot(
    engine: web::Data<BookingEngine>,
    slot_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let slot = engine.withdraw_slot(*slot_id)?;
    Ok(HttpResponse::Ok().json(slot))
}

/// Reserve a unit and create a pending booking
pub async fn create_booking(
    engine: web::Data<BookingEngine>,
    request: web::Json<CreateBookingRequest>,
) -> Result<HttpResponse, ApiError> {
    request.validate()?;
    let booking = engine.create_booking(request.slot_id, request.nurse_id)?;
    Ok(HttpResponse::Created().json(booking))
}

/// Get booking with payments and session
pub async fn get_booking(
    engine: web::Data<BookingEngine>,
    booking_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let booking = engine.booking(*booking_id)?;
    let payments = engine.payments_for_booking(*booking_id)?;
    let session = match engine.session(*booking_id) {
        Ok(session) => Some(session),
        Err(booking_core::Error::SessionNotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    Ok(HttpResponse::Ok().json(BookingDetails {
        booking,
        payments,
        session,
    }))
}

/// Cancel a pending booking
pub async fn cancel_booking(
    engine: web::Data<BookingEngine>,
    booking_id: web::Path<Uuid>,
    request: Option<web::Json<CancelBookingRequest>>,
) -> Result<HttpResponse, ApiError> {
    let request = request.map(|r| r.into_inner()).unwrap_or_default();
    request.validate()?;
    let booking = engine.cancel_booking(*booking_id, request.reason.as_deref())?;
    Ok(HttpResponse::Ok().json(booking))
}

/// Explicit completion signal
pub async fn complete_booking(
    engine: web::Data<BookingEngine>,
    booking_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let booking = engine.complete_booking(*booking_id)?;
    Ok(HttpResponse::Ok().json(booking))
}

/// Provision the video session of a paid booking
pub async fn provision_session(
    engine: web::Data<BookingEngine>,
    booking_id: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let session = engine.provision_session(*booking_id).await?;
    Ok(HttpResponse::Created().json(session))
}

/// Start a payment attempt
pub async fn initiate_payment(
    engine: web::Data<BookingEngine>,
    request: web::Json<InitiatePaymentRequest>,
) -> Result<HttpResponse, ApiError> {
    request.validate()?;
    let request = request.into_inner();
    let payment =
        engine.initiate_payment(request.booking_id, request.amount, Gateway::new(request.gateway))?;
    Ok(HttpResponse::Created().json(payment))
}

/// Gateway outcome webhook
pub async fn report_payment_outcome(
    engine: web::Data<BookingEngine>,
    transaction_id: web::Path<String>,
    request: web::Json<PaymentOutcomeRequest>,
) -> Result<HttpResponse, ApiError> {
    let report = engine.report_payment_outcome(&transaction_id, request.status)?;

    Ok(HttpResponse::Ok().json(json!({
        "transaction_id": report.payment.transaction_id,
        "status": report.payment.status,
        "replayed": report.replayed,
        "booking_id": report.booking.booking_id,
        "booking_state": report.booking.state
    })))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health_check))
            .route("/metrics", web::get().to(metrics))
            .route("/slots/{mentor_id}", web::post().to(create_slot))
            .route("/slots/{mentor_id}", web::get().to(list_slots))
            .route("/slots/{slot_id}/withdraw", web::post().to(withdraw_slot))
            .route("/bookings", web::post().to(create_booking))
            .route("/bookings/{id}", web::get().to(get_booking))
            .route("/bookings/{id}/cancel", web::post().to(cancel_booking))
            .route("/bookings/{id}/complete", web::post().to(complete_booking))
            .route("/bookings/{id}/session", web::post().to(provision_session))
            .route("/payments", web::post().to(initiate_payment))
            .route(
                "/payments/{transaction_id}/outcome",
                web::post().to(report_payment_outcome),
            ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use booking_core::{Booking, Config, LoopbackProvider, PaymentRecord};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn engine() -> BookingEngine {
        BookingEngine::new(Config::default(), Arc::new(LoopbackProvider::default())).unwrap()
    }

    fn slot_body(capacity: u32) -> serde_json::Value {
        let start = Utc::now() + Duration::hours(4);
        json!({
            "start": start,
            "end": start + Duration::minutes(30),
            "capacity": capacity,
            "price": "25.00"
        })
    }

    #[actix_web::test]
    async fn test_health() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(engine()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_booking_flow_over_http() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(engine()))
                .configure(configure_routes),
        )
        .await;

        let mentor_id = Uuid::now_v7();
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/slots/{mentor_id}"))
            .set_json(slot_body(1))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let slot: serde_json::Value = test::read_body_json(resp).await;
        let slot_id = slot["slot_id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/api/v1/bookings")
            .set_json(json!({ "slot_id": slot_id, "nurse_id": Uuid::now_v7() }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let booking: Booking = test::read_body_json(resp).await;
        assert_eq!(booking.state.as_str(), "pending");

        // Capacity is 1
        let req = test::TestRequest::post()
            .uri("/api/v1/bookings")
            .set_json(json!({ "slot_id": slot_id, "nurse_id": Uuid::now_v7() }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let error: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(error["error"]["type"], "slot_full");

        let req = test::TestRequest::post()
            .uri("/api/v1/payments")
            .set_json(json!({
                "booking_id": booking.booking_id,
                "amount": booking.amount,
                "gateway": "stripe"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let payment: PaymentRecord = test::read_body_json(resp).await;

        for _ in 0..2 {
            let req = test::TestRequest::post()
                .uri(&format!("/api/v1/payments/{}/outcome", payment.transaction_id))
                .set_json(json!({ "status": "completed" }))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/bookings/{}/session", booking.booking_id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/bookings/{}", booking.booking_id))
            .to_request();
        let details: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(details["state"], "confirmed");
        assert_eq!(details["payments"].as_array().unwrap().len(), 1);
        assert!(details["session"]["join_url"].is_string());
    }

    #[actix_web::test]
    async fn test_cancel_without_body_and_conflicting_outcome() {
        let engine = engine();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(engine.clone()))
                .configure(configure_routes),
        )
        .await;

        let start = Utc::now() + Duration::hours(1);
        let slot = engine
            .create_slot(
                Uuid::now_v7(),
                booking_core::NewSlot {
                    start,
                    end: start + Duration::minutes(30),
                    capacity: 1,
                    price: rust_decimal::Decimal::new(1000, 2),
                    session_type: Default::default(),
                },
            )
            .unwrap();
        let booking = engine.create_booking(slot.slot_id, Uuid::now_v7()).unwrap();
        let payment = engine
            .initiate_payment(booking.booking_id, booking.amount, Gateway::new("stripe"))
            .unwrap();
        engine
            .report_payment_outcome(&payment.transaction_id, booking_core::PaymentStatus::Failed)
            .unwrap();

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/payments/{}/outcome", payment.transaction_id))
            .set_json(json!({ "status": "completed" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // payment_failed cannot be cancelled
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/bookings/{}/cancel", booking.booking_id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let other = engine.create_booking(slot.slot_id, Uuid::now_v7()).unwrap();
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/bookings/{}/cancel", other.booking_id))
            .set_json(json!({ "reason": "schedule clash" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(engine.slot(slot.slot_id).unwrap().reserved_count, 0);
    }

    #[actix_web::test]
    async fn test_invalid_slot_request_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(engine()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/slots/{}", Uuid::now_v7()))
            .set_json(slot_body(0))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/bookings/{}", Uuid::now_v7()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
