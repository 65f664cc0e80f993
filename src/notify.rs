use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// Details a confirmation message is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingConfirmation {
    pub event_id: EventId,
    pub professional_id: ProfessionalId,
    pub customer_id: CustomerId,
    pub date: NaiveDate,
    pub span: Span,
    pub service_name: String,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    BookingConfirmed(BookingConfirmation),
    /// A replayed guest booking lost its slot; the customer must pick again.
    ReplayRejected {
        customer_id: CustomerId,
        conflicting: CalendarEvent,
    },
}

/// Broadcast hub for domain events. Publishing never blocks or fails the
/// publisher.
pub struct NotifyHub {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn publish(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            debug!("domain event dropped: no subscribers");
        }
    }
}

/// Outbound customer messaging (email, SMS, push).
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_booking_confirmation(&self, details: &BookingConfirmation) -> Result<(), String>;

    async fn send_replay_rejected(
        &self,
        _customer_id: CustomerId,
        _conflicting: &CalendarEvent,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Dispatcher that only logs; used when no delivery channel is configured.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send_booking_confirmation(&self, details: &BookingConfirmation) -> Result<(), String> {
        info!(
            "confirmation for {}: {} {} on {} ({})",
            details.customer_id, details.service_name, details.span, details.date, details.status
        );
        Ok(())
    }

    async fn send_replay_rejected(
        &self,
        customer_id: CustomerId,
        conflicting: &CalendarEvent,
    ) -> Result<(), String> {
        info!(
            "replay rejected for {customer_id}: slot taken by {}",
            conflicting.describe()
        );
        Ok(())
    }
}

/// Consume domain events and hand them to the dispatcher.
/// Delivery is best-effort: failures are logged and counted, never retried.
pub async fn run_notification_worker(
    mut rx: broadcast::Receiver<DomainEvent>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(n);
                warn!("notification worker lagged, {n} events skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let result = match &event {
            DomainEvent::BookingConfirmed(details) => {
                dispatcher.send_booking_confirmation(details).await
            }
            DomainEvent::ReplayRejected {
                customer_id,
                conflicting,
            } => dispatcher.send_replay_rejected(*customer_id, conflicting).await,
        };
        if let Err(e) = result {
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            warn!("notification delivery failed: {e}");
        }
    }
    debug!("notification worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    fn confirmation() -> BookingConfirmation {
        BookingConfirmation {
            event_id: Ulid::new(),
            professional_id: Ulid::new(),
            customer_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            span: Span::new(600, 630),
            service_name: "Cut".into(),
            status: ReservationStatus::Pending,
        }
    }

    struct FlakyDispatcher {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl NotificationDispatcher for FlakyDispatcher {
        async fn send_booking_confirmation(&self, _details: &BookingConfirmation) -> Result<(), String> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n == 0 { Err("smtp down".into()) } else { Ok(()) }
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        let event = DomainEvent::BookingConfirmed(confirmation());
        hub.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(DomainEvent::BookingConfirmed(confirmation()));
    }

    #[tokio::test]
    async fn worker_survives_dispatch_failure() {
        let hub = NotifyHub::new();
        let dispatcher = Arc::new(FlakyDispatcher {
            attempts: AtomicUsize::new(0),
        });
        let worker = tokio::spawn(run_notification_worker(hub.subscribe(), dispatcher.clone()));

        hub.publish(DomainEvent::BookingConfirmed(confirmation()));
        hub.publish(DomainEvent::BookingConfirmed(confirmation()));
        drop(hub); // closes the channel once drained

        worker.await.unwrap();
        assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 2);
    }
}
