use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The write would overlap this occupying event.
    Conflict(Box<CalendarEvent>),
    NotFound(EventId),
    /// A conditional update found the event in a different status.
    StatusChanged {
        id: EventId,
        actual: Option<ReservationStatus>,
    },
    Invalid(String),
    /// Transient I/O failure.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(event) => write!(f, "overlaps event {}", event.id),
            StoreError::NotFound(id) => write!(f, "event not found: {id}"),
            StoreError::StatusChanged { id, actual: Some(actual) } => {
                write!(f, "event {id} changed concurrently, now {actual}")
            }
            StoreError::StatusChanged { id, actual: None } => {
                write!(f, "event {id} changed concurrently")
            }
            StoreError::Invalid(msg) => write!(f, "invalid write: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Partial update of an existing event. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub date: Option<NaiveDate>,
    pub span: Option<Span>,
    pub status: Option<ReservationStatus>,
    /// Apply only if the event still has this status.
    pub expected_status: Option<ReservationStatus>,
}

/// The transactional record store the engine reads and writes through.
///
/// Implementations must make `insert_event` and `update_event` fail with
/// `StoreError::Conflict` when the result would overlap another occupying
/// event of the same professional on the same date. That guard is the
/// authority against double-booking; the engine's own re-check only narrows
/// the race window. A patch with `expected_status` must be checked against
/// the stored status in the same step, failing with `StatusChanged`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_events(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
        event_type: EventType,
    ) -> Result<Vec<CalendarEvent>, StoreError>;

    async fn get_event(&self, id: EventId) -> Result<Option<CalendarEvent>, StoreError>;

    async fn insert_event(&self, event: CalendarEvent) -> Result<EventId, StoreError>;

    async fn update_event(&self, id: EventId, patch: EventPatch) -> Result<(), StoreError>;
}

// ── In-memory store ──────────────────────────────────────────────

/// One professional's events, sorted by `(date, span.start)`.
#[derive(Debug, Clone)]
pub struct ProfessionalCalendar {
    pub professional_id: ProfessionalId,
    pub events: Vec<CalendarEvent>,
}

impl ProfessionalCalendar {
    pub fn new(professional_id: ProfessionalId) -> Self {
        Self {
            professional_id,
            events: Vec::new(),
        }
    }

    /// Insert event maintaining sort order.
    pub fn insert_event(&mut self, event: CalendarEvent) {
        let key = (event.date, event.span.start);
        let pos = self
            .events
            .binary_search_by_key(&key, |e| (e.date, e.span.start))
            .unwrap_or_else(|e| e);
        self.events.insert(pos, event);
    }

    pub fn remove_event(&mut self, id: EventId) -> Option<CalendarEvent> {
        let pos = self.events.iter().position(|e| e.id == id)?;
        Some(self.events.remove(pos))
    }

    pub fn on_date(&self, date: NaiveDate) -> &[CalendarEvent] {
        let lo = self.events.partition_point(|e| e.date < date);
        let hi = self.events.partition_point(|e| e.date <= date);
        &self.events[lo..hi]
    }

    /// First occupying event on `date` overlapping `span`, skipping `exclude`.
    pub fn first_overlap(
        &self,
        date: NaiveDate,
        span: &Span,
        exclude: Option<EventId>,
    ) -> Option<&CalendarEvent> {
        self.on_date(date)
            .iter()
            .take_while(|e| e.span.start < span.end)
            .find(|e| Some(e.id) != exclude && e.occupies() && e.span.overlaps(span))
    }
}

pub type SharedCalendar = Arc<RwLock<ProfessionalCalendar>>;

/// Reference `RecordStore`. The per-professional write lock makes the
/// overlap check and the insert one atomic step.
pub struct InMemoryStore {
    calendars: DashMap<ProfessionalId, SharedCalendar>,
    /// Reverse lookup: event id → professional id
    event_to_professional: DashMap<EventId, ProfessionalId>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            event_to_professional: DashMap::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.event_to_professional.len()
    }

    fn calendar(&self, id: &ProfessionalId) -> Option<SharedCalendar> {
        self.calendars.get(id).map(|e| e.value().clone())
    }

    fn calendar_or_create(&self, id: ProfessionalId) -> SharedCalendar {
        self.calendars
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProfessionalCalendar::new(id))))
            .value()
            .clone()
    }

    /// Every event of a professional, in calendar order.
    pub async fn events_for(&self, professional_id: ProfessionalId) -> Vec<CalendarEvent> {
        match self.calendar(&professional_id) {
            Some(cal) => cal.read().await.events.clone(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn list_events(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
        event_type: EventType,
    ) -> Result<Vec<CalendarEvent>, StoreError> {
        let Some(cal) = self.calendar(&professional_id) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        Ok(guard
            .on_date(date)
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<CalendarEvent>, StoreError> {
        let Some(pid) = self.event_to_professional.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(cal) = self.calendar(&pid) else {
            return Ok(None);
        };
        let guard = cal.read().await;
        Ok(guard.events.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_event(&self, event: CalendarEvent) -> Result<EventId, StoreError> {
        if event.span.start >= event.span.end {
            return Err(StoreError::Invalid("event interval is empty".into()));
        }
        if self.event_to_professional.contains_key(&event.id) {
            return Err(StoreError::Invalid(format!("duplicate event id {}", event.id)));
        }
        let cal = self.calendar_or_create(event.professional_id);
        let mut guard = cal.write().await;
        if event.occupies()
            && let Some(existing) = guard.first_overlap(event.date, &event.span, None)
        {
            return Err(StoreError::Conflict(Box::new(existing.clone())));
        }
        let id = event.id;
        self.event_to_professional.insert(id, event.professional_id);
        guard.insert_event(event);
        Ok(id)
    }

    async fn update_event(&self, id: EventId, patch: EventPatch) -> Result<(), StoreError> {
        let pid = self
            .event_to_professional
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let cal = self.calendar(&pid).ok_or(StoreError::NotFound(id))?;
        let mut guard = cal.write().await;

        let mut updated = guard
            .events
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        if let Some(expected) = patch.expected_status
            && updated.status() != Some(expected)
        {
            return Err(StoreError::StatusChanged {
                id,
                actual: updated.status(),
            });
        }
        if let Some(date) = patch.date {
            updated.date = date;
        }
        if let Some(span) = patch.span {
            if span.start >= span.end {
                return Err(StoreError::Invalid("event interval is empty".into()));
            }
            updated.span = span;
        }
        if let Some(status) = patch.status
            && !updated.set_status(status)
        {
            return Err(StoreError::Invalid("time blocks have no status".into()));
        }

        if updated.occupies()
            && let Some(existing) = guard.first_overlap(updated.date, &updated.span, Some(id))
        {
            return Err(StoreError::Conflict(Box::new(existing.clone())));
        }
        guard.remove_event(id);
        guard.insert_event(updated);
        Ok(())
    }
}
