use ulid::Ulid;

use crate::model::{CalendarEvent, EventType, ProfessionalId, ReservationStatus, ServiceId};
use crate::workflow::Step;

use super::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed time/date input, rejected before reaching the store.
    Format(String),
    /// The requested interval overlaps an occupying event.
    Conflict(Box<CalendarEvent>),
    /// Transient record store failure; retrying is the caller's call.
    Store(String),
    /// One of the three occupancy queries failed.
    PartialAggregation { source: EventType, reason: String },
    NotFound(Ulid),
    InvalidTransition { step: Step, action: &'static str },
    InvalidStatusChange {
        from: Option<ReservationStatus>,
        to: ReservationStatus,
    },
    NotQualified {
        professional_id: ProfessionalId,
        service_id: ServiceId,
    },
    NoQualifiedProfessional(ServiceId),
    /// Only pending or confirmed reservations can move.
    NotReschedulable(Ulid),
    IdentityRequired,
    NotGuest,
    LimitExceeded(&'static str),
    Stash(String),
}

impl EngineError {
    pub fn conflicting_event(&self) -> Option<&CalendarEvent> {
        match self {
            EngineError::Conflict(event) => Some(event.as_ref()),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    /// Short machine-readable tag for wire responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Format(_) => "format",
            EngineError::Conflict(_) => "conflict",
            EngineError::Store(_) => "store",
            EngineError::PartialAggregation { .. } => "partial_aggregation",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidStatusChange { .. } => "invalid_status_change",
            EngineError::NotQualified { .. } => "not_qualified",
            EngineError::NoQualifiedProfessional(_) => "no_qualified_professional",
            EngineError::NotReschedulable(_) => "not_reschedulable",
            EngineError::IdentityRequired => "identity_required",
            EngineError::NotGuest => "not_guest",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Stash(_) => "stash",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Format(msg) => write!(f, "format error: {msg}"),
            EngineError::Conflict(event) => write!(
                f,
                "the selected slot is no longer available: it overlaps a {}",
                event.describe()
            ),
            EngineError::Store(e) => write!(f, "record store error: {e}"),
            EngineError::PartialAggregation { source, reason } => write!(
                f,
                "occupancy unknown: {} query failed: {reason}",
                source.label()
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidTransition { step, action } => {
                write!(f, "cannot {action} from step {step:?}")
            }
            EngineError::InvalidStatusChange { from: Some(from), to } => {
                write!(f, "cannot change status from {from} to {to}")
            }
            EngineError::InvalidStatusChange { from: None, to } => {
                write!(f, "time blocks have no status; cannot set {to}")
            }
            EngineError::NotQualified {
                professional_id,
                service_id,
            } => write!(
                f,
                "professional {professional_id} does not offer service {service_id}"
            ),
            EngineError::NoQualifiedProfessional(id) => {
                write!(f, "no professional offers service {id}")
            }
            EngineError::NotReschedulable(id) => {
                write!(f, "event {id} is not an active reservation")
            }
            EngineError::IdentityRequired => write!(f, "sign in to complete this booking"),
            EngineError::NotGuest => write!(f, "only guest bookings can be stashed"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Stash(e) => write!(f, "pending booking store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(event) => EngineError::Conflict(event),
            StoreError::NotFound(id) => EngineError::NotFound(id),
            e @ StoreError::StatusChanged { .. } => EngineError::Store(e.to_string()),
            StoreError::Invalid(msg) => EngineError::Format(msg),
            StoreError::Unavailable(msg) => EngineError::Store(msg),
        }
    }
}
