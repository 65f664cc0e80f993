mod availability;
mod conflict;
mod error;
mod mutations;
mod occupancy;
mod slots;
pub mod store;

pub use availability::{AnyAvailability, AssignmentPolicy, AvailabilityResult, Candidate};
pub use conflict::{evaluate, first_conflict};
pub use error::EngineError;
pub use occupancy::{Occupied, collect_occupied};
pub use slots::{SlotCandidates, slot_candidates};
pub use store::{EventPatch, InMemoryStore, RecordStore, StoreError};

use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::loyalty::LoyaltyLedger;
use crate::model::*;
use crate::notify::{BookingConfirmation, DomainEvent, NotifyHub};

/// The scheduling and availability engine.
///
/// Holds no per-session state: every call reads the record store afresh, and
/// the only shared mutable state lives behind the `RecordStore`.
pub struct Engine {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn LoyaltyLedger>,
    pub notify: Arc<NotifyHub>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn LoyaltyLedger>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            notify,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Side effects shared by every path that creates a reservation:
    /// the loyalty visit (only for completed reservations) and the
    /// `BookingConfirmed` domain event.
    pub(crate) async fn after_commit(&self, event: &CalendarEvent, actor_id: Ulid, service_name: &str) {
        if event.status() == Some(ReservationStatus::Completed) {
            self.record_visit(event, actor_id).await;
        }
        let Some(customer_id) = event.customer_id() else {
            return;
        };
        self.notify.publish(DomainEvent::BookingConfirmed(BookingConfirmation {
            event_id: event.id,
            professional_id: event.professional_id,
            customer_id,
            date: event.date,
            span: event.span,
            service_name: service_name.to_string(),
            status: event.status().unwrap_or(ReservationStatus::Pending),
        }));
    }

    /// Credit a loyalty visit. A ledger failure never undoes the reservation.
    pub(crate) async fn record_visit(&self, event: &CalendarEvent, actor_id: Ulid) {
        let Some(customer_id) = event.customer_id() else {
            return;
        };
        let note = format!("visit {} {}", event.date, event.span);
        match self.ledger.record_visit(customer_id, actor_id, &note).await {
            Ok(()) => info!("loyalty visit recorded for {customer_id} (event {})", event.id),
            Err(e) => {
                metrics::counter!(crate::observability::LOYALTY_FAILURES_TOTAL).increment(1);
                warn!("loyalty visit for {customer_id} not recorded: {e}");
            }
        }
    }
}
