//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the booking engine.
//!
//! # Metrics
//!
//! - `booking_reservations_total{result}` - Reserve attempts by outcome
//! - `booking_transitions_total{from,to}` - Accepted state transitions
//! - `booking_rejected_transitions_total{action}` - Rejected transition attempts
//! - `booking_payment_outcomes_total{status,result}` - Gateway outcome reports
//! - `booking_outcome_anomalies_total{kind}` - Operator-visible idempotency anomalies
//! - `booking_provision_attempts_total{result}` - Video provider calls
//! - `booking_provision_duration_seconds` - Video provider latency
//! - `booking_notifications_total{result}` - Notification deliveries
//! - `booking_sweep_actions_total{action}` - Expiry sweep actions

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Reserve attempts
    pub reservations: IntCounterVec,

    /// Accepted transitions
    pub transitions: IntCounterVec,

    /// Rejected transitions
    pub rejected_transitions: IntCounterVec,

    /// Payment outcome reports
    pub payment_outcomes: IntCounterVec,

    /// Idempotency / reconciliation anomalies
    pub anomalies: IntCounterVec,

    /// Provider attempts
    pub provision_attempts: IntCounterVec,

    /// Provider latency
    pub provision_duration: Histogram,

    /// Notification deliveries
    pub notifications: IntCounterVec,

    /// Sweep actions
    pub sweep_actions: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let reservations = counter_vec(
            &registry,
            "booking_reservations_total",
            "Slot reserve attempts by outcome",
            &["result"],
        )?;
        let transitions = counter_vec(
            &registry,
            "booking_transitions_total",
            "Accepted booking state transitions",
            &["from", "to"],
        )?;
        let rejected_transitions = counter_vec(
            &registry,
            "booking_rejected_transitions_total",
            "Rejected booking transition attempts",
            &["action"],
        )?;
        let payment_outcomes = counter_vec(
            &registry,
            "booking_payment_outcomes_total",
            "Payment gateway outcome reports",
            &["status", "result"],
        )?;
        let anomalies = counter_vec(
            &registry,
            "booking_outcome_anomalies_total",
            "Idempotency conflicts and reconciliation anomalies",
            &["kind"],
        )?;
        let provision_attempts = counter_vec(
            &registry,
            "booking_provision_attempts_total",
            "Video provider calls by outcome",
            &["result"],
        )?;

        let provision_duration = Histogram::with_opts(
            HistogramOpts::new(
                "booking_provision_duration_seconds",
                "Video provider call latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(provision_duration.clone()))?;

        let notifications = counter_vec(
            &registry,
            "booking_notifications_total",
            "Notification deliveries by outcome",
            &["result"],
        )?;
        let sweep_actions = counter_vec(
            &registry,
            "booking_sweep_actions_total",
            "Expiry sweep actions",
            &["action"],
        )?;

        Ok(Self {
            reservations,
            transitions,
            rejected_transitions,
            payment_outcomes,
            anomalies,
            provision_attempts,
            provision_duration,
            notifications,
            sweep_actions,
            registry,
        })
    }

    /// Record reserve attempt
    pub fn record_reservation(&self, result: &str) {
        self.reservations.with_label_values(&[result]).inc();
    }

    /// Record accepted transition
    pub fn record_transition(&self, from: &str, to: &str) {
        self.transitions.with_label_values(&[from, to]).inc();
    }

    /// Record rejected transition
    pub fn record_rejected_transition(&self, action: &str) {
        self.rejected_transitions.with_label_values(&[action]).inc();
    }

    /// Record payment outcome report
    pub fn record_payment_outcome(&self, status: &str, result: &str) {
        self.payment_outcomes.with_label_values(&[status, result]).inc();
    }

    /// Record anomaly
    pub fn record_anomaly(&self, kind: &str) {
        self.anomalies.with_label_values(&[kind]).inc();
    }

    /// Record provider attempt
    pub fn record_provision_attempt(&self, result: &str, duration_seconds: f64) {
        self.provision_attempts.with_label_values(&[result]).inc();
        self.provision_duration.observe(duration_seconds);
    }

    /// Record notification delivery
    pub fn record_notification(&self, result: &str) {
        self.notifications.with_label_values(&[result]).inc();
    }

    /// Record sweep action
    pub fn record_sweep_action(&self, action: &str) {
        self.sweep_actions.with_label_values(&[action]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        // Names are static and the registry is private, so registration cannot collide
        Self::new().unwrap_or_else(|e| panic!("metric registration failed: {e}"))
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reservation("ok");
        metrics.record_transition("pending", "paid");

        assert_eq!(metrics.reservations.with_label_values(&["ok"]).get(), 1);
        assert_eq!(
            metrics.transitions.with_label_values(&["pending", "paid"]).get(),
            1
        );
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_anomaly("conflicting_outcome");
        assert_eq!(b.anomalies.with_label_values(&["conflicting_outcome"]).get(), 0);
    }

    #[test]
    fn test_render_contains_names() {
        let metrics = Metrics::new().unwrap();
        metrics.record_sweep_action("expired");
        let text = metrics.render();
        assert!(text.contains("booking_sweep_actions_total"));
    }
}
