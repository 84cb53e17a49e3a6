//! Notification fan-out
//!
//! The state machine only sees the [`Notifier`] capability. The production
//! implementation, [`NotificationDispatcher`], routes every event to one of N
//! partitions by hashing its booking id; each partition is a bounded queue
//! drained by a single worker, so events of one booking reach subscribers in
//! commit order while different bookings proceed in parallel.
//!
//! ```text
//!   transition ──publish()──► partition = blake3(booking_id) % N
//!                                   │ try_send (never blocks)
//!                                   ▼
//!                     worker[p] ──deliver()──► subscriber 1..k
//! ```
//!
//! Delivery is best effort: a full queue drops the event, a failing
//! subscriber is logged and skipped. Nothing is persisted for replay.

use crate::{config::NotificationConfig, metrics::Metrics, types::NotificationEvent, Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Publish capability consumed by the state machine
pub trait Notifier: Send + Sync {
    /// Hand an event off for delivery. Must not block or fail the caller.
    fn publish(&self, event: NotificationEvent);
}

/// Receiver of dispatched events (socket hub, push gateway, audit log, ...)
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver one event
    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

/// Partitioned, ordered-per-booking dispatcher
pub struct NotificationDispatcher {
    partitions: Vec<mpsc::Sender<NotificationEvent>>,
    subscribers: Arc<RwLock<Vec<Arc<dyn Subscriber>>>>,
    metrics: Metrics,
}

impl NotificationDispatcher {
    /// Spawn one worker per partition. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: &NotificationConfig,
        subscribers: Vec<Arc<dyn Subscriber>>,
        metrics: Metrics,
    ) -> Self {
        let subscribers = Arc::new(RwLock::new(subscribers));
        let partition_count = config.partitions.max(1) as usize;
        let mut partitions = Vec::with_capacity(partition_count);

        for partition in 0..partition_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            tokio::spawn(run_partition(
                partition,
                rx,
                subscribers.clone(),
                metrics.clone(),
            ));
            partitions.push(tx);
        }

        info!("Notification dispatcher started with {} partitions", partition_count);

        Self {
            partitions,
            subscribers,
            metrics,
        }
    }

    /// Register another subscriber; it sees events published from now on
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        info!("Adding notification subscriber {}", subscriber.name());
        self.subscribers.write().push(subscriber);
    }

    /// Partition an event for this booking lands on
    pub fn partition_for(&self, booking_id: Uuid) -> usize {
        partition_number(booking_id, self.partitions.len() as u32) as usize
    }

    /// Number of partitions
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

impl Notifier for NotificationDispatcher {
    fn publish(&self, event: NotificationEvent) {
        let partition = self.partition_for(event.booking_id);
        let event_type = event.event_type;
        let booking_id = event.booking_id;

        if let Err(e) = self.partitions[partition].try_send(event) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue_full",
                mpsc::error::TrySendError::Closed(_) => "worker_closed",
            };
            warn!(
                %booking_id,
                event_type = %event_type,
                partition,
                "Dropping notification: {}",
                reason
            );
            self.metrics.record_notification(reason);
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("partitions", &self.partitions.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

/// Stable partition number for a booking
pub fn partition_number(booking_id: Uuid, num_partitions: u32) -> u32 {
    let hash = blake3::hash(booking_id.as_bytes());
    let bytes = hash.as_bytes();
    let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    value % num_partitions.max(1)
}

async fn run_partition(
    partition: usize,
    mut rx: mpsc::Receiver<NotificationEvent>,
    subscribers: Arc<RwLock<Vec<Arc<dyn Subscriber>>>>,
    metrics: Metrics,
) {
    while let Some(event) = rx.recv().await {
        // Snapshot so the lock is not held across awaits
        let targets: Vec<Arc<dyn Subscriber>> = subscribers.read().clone();

        for subscriber in targets {
            match subscriber.deliver(&event).await {
                Ok(()) => metrics.record_notification("delivered"),
                Err(e) => {
                    warn!(
                        booking_id = %event.booking_id,
                        event_type = %event.event_type,
                        subscriber = subscriber.name(),
                        "Notification delivery failed: {}",
                        e
                    );
                    metrics.record_notification("failed");
                }
            }
        }
    }

    debug!("Notification partition {} stopped", partition);
}

/// Forwards events into a channel (event streams, tests)
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    name: String,
    sender: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelSubscriber {
    /// Create subscriber and the receiving end
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| Error::Concurrency(format!("Subscriber {} receiver dropped", self.name)))
    }
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        info!(
            booking_id = %event.booking_id,
            mentor_id = %event.mentor_id,
            nurse_id = %event.nurse_id,
            sequence = event.sequence,
            "Booking event {}",
            event.event_type
        );
        Ok(())
    }
}

/// Synchronous in-memory notifier for unit tests and embedding
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    /// Create empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    /// Events of one booking
    pub fn events_for(&self, booking_id: Uuid) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.booking_id == booking_id)
            .cloned()
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, event: NotificationEvent) {
        self.events.lock().push(event);
    }
}
