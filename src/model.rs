use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MINUTES_PER_DAY;

/// Minute of day, `0..=1440`. The only time-of-day type.
pub type Minute = u32;

pub type ProfessionalId = Ulid;
pub type CustomerId = Ulid;
pub type ServiceId = Ulid;
pub type EventId = Ulid;

/// Strict half-open overlap: back-to-back intervals do not conflict.
pub fn overlaps(a_start: Minute, a_end: Minute, b_start: Minute, b_end: Minute) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Validating constructor for caller-supplied bounds.
    pub fn try_new(start: Minute, end: Minute) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::Format(format!(
                "interval {}-{} is empty",
                format_time(start),
                format_time(end)
            )));
        }
        if end > MINUTES_PER_DAY {
            return Err(EngineError::Format(format!(
                "interval starting {} runs past midnight",
                format_time(start)
            )));
        }
        Ok(Self { start, end })
    }

    /// `[start, start + duration)`, rejected if it would leave the day.
    pub fn from_duration(start: Minute, duration: Minute) -> Result<Self, EngineError> {
        Self::try_new(start, start.saturating_add(duration))
    }

    /// Parse a pair of time strings, e.g. `("9:00", "09:30:00")`.
    pub fn parse(start: &str, end: &str) -> Result<Self, EngineError> {
        Self::try_new(parse_time(start)?, parse_time(end)?)
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", format_time(self.start), format_time(self.end))
    }
}

/// One `:`-separated field of a time string.
fn time_field(part: Option<&str>, min_width: usize, max: Minute) -> Option<Minute> {
    let part = part?;
    if part.len() < min_width || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: Minute = part.parse().ok()?;
    (value <= max).then_some(value)
}

/// Normalize `H:MM`, `HH:MM` or `HH:MM:SS` to a minute of day.
/// Seconds are accepted and truncated; `24:00` is the end of the day.
pub fn parse_time(s: &str) -> Result<Minute, EngineError> {
    let mut parts = s.trim().split(':');
    let hour = time_field(parts.next(), 1, 24);
    let minute = time_field(parts.next(), 2, 59);
    let second = match parts.next() {
        None => Some(0),
        some => time_field(some, 2, 59),
    };
    match (hour, minute, second, parts.next()) {
        (Some(h), Some(m), Some(_), None) if h * 60 + m <= MINUTES_PER_DAY => Ok(h * 60 + m),
        _ => Err(EngineError::Format(format!("malformed time: {s:?}"))),
    }
}

pub fn format_time(minute: Minute) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::Format(format!("malformed date: {s:?}")))
}

// ── Calendar events ──────────────────────────────────────────────

/// Lifecycle of a reservation. Time blocks carry no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    /// Everything except a cancellation keeps the professional busy.
    pub fn occupies(self) -> bool {
        self != ReservationStatus::Cancelled
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Cancelled | ReservationStatus::NoShow
        )
    }

    pub fn can_become(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        match (self, next) {
            (Pending, Confirmed | Completed | Cancelled | NoShow) => true,
            (Confirmed, Completed | Cancelled | NoShow) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "completed" => Ok(ReservationStatus::Completed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "no_show" | "no-show" => Ok(ReservationStatus::NoShow),
            other => Err(EngineError::Format(format!("unknown status: {other:?}"))),
        }
    }
}

/// The three independently stored event sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Service,
    Combo,
    Block,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Service, EventType::Combo, EventType::Block];

    pub fn label(self) -> &'static str {
        match self {
            EventType::Service => "service",
            EventType::Combo => "combo",
            EventType::Block => "block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServiceReservation {
        service_id: ServiceId,
        customer_id: CustomerId,
        status: ReservationStatus,
        notes: Option<String>,
    },
    ComboReservation {
        combo_id: ServiceId,
        service_ids: Vec<ServiceId>,
        customer_id: CustomerId,
        status: ReservationStatus,
        notes: Option<String>,
    },
    TimeBlock {
        reason: String,
        recurring: bool,
    },
}

/// Anything that can sit on a professional's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: EventId,
    pub professional_id: ProfessionalId,
    pub date: NaiveDate,
    pub span: Span,
    pub kind: EventKind,
}

impl CalendarEvent {
    pub fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::ServiceReservation { .. } => EventType::Service,
            EventKind::ComboReservation { .. } => EventType::Combo,
            EventKind::TimeBlock { .. } => EventType::Block,
        }
    }

    pub fn status(&self) -> Option<ReservationStatus> {
        match &self.kind {
            EventKind::ServiceReservation { status, .. }
            | EventKind::ComboReservation { status, .. } => Some(*status),
            EventKind::TimeBlock { .. } => None,
        }
    }

    /// Returns false for time blocks, which have no status to change.
    pub fn set_status(&mut self, next: ReservationStatus) -> bool {
        match &mut self.kind {
            EventKind::ServiceReservation { status, .. }
            | EventKind::ComboReservation { status, .. } => {
                *status = next;
                true
            }
            EventKind::TimeBlock { .. } => false,
        }
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        match &self.kind {
            EventKind::ServiceReservation { customer_id, .. }
            | EventKind::ComboReservation { customer_id, .. } => Some(*customer_id),
            EventKind::TimeBlock { .. } => None,
        }
    }

    /// Blocks always occupy; reservations unless cancelled.
    pub fn occupies(&self) -> bool {
        self.status().is_none_or(ReservationStatus::occupies)
    }

    /// Human-readable description used in conflict reasons.
    pub fn describe(&self) -> String {
        match &self.kind {
            EventKind::ServiceReservation { status, .. } => {
                format!("{status} booking {} on {}", self.span, self.date)
            }
            EventKind::ComboReservation { status, .. } => {
                format!("{status} combo booking {} on {}", self.span, self.date)
            }
            EventKind::TimeBlock { reason, .. } if reason.is_empty() => {
                format!("time block {} on {}", self.span, self.date)
            }
            EventKind::TimeBlock { reason, .. } => {
                format!("time block {} on {} ({reason})", self.span, self.date)
            }
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    /// Minutes.
    pub duration: Minute,
    /// Professionals offering this service, in catalog order.
    pub professionals: Vec<ProfessionalId>,
}

/// Bundled services scheduled back to back under one primary professional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboDefinition {
    pub id: ServiceId,
    pub name: String,
    pub services: Vec<Service>,
    pub professionals: Vec<ProfessionalId>,
}

impl ComboDefinition {
    pub fn duration(&self) -> Minute {
        self.services.iter().map(|s| s.duration).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSelection {
    Single(Service),
    Combo(ComboDefinition),
}

impl ServiceSelection {
    pub fn id(&self) -> ServiceId {
        match self {
            ServiceSelection::Single(s) => s.id,
            ServiceSelection::Combo(c) => c.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServiceSelection::Single(s) => &s.name,
            ServiceSelection::Combo(c) => &c.name,
        }
    }

    pub fn duration(&self) -> Minute {
        match self {
            ServiceSelection::Single(s) => s.duration,
            ServiceSelection::Combo(c) => c.duration(),
        }
    }

    pub fn qualified(&self) -> &[ProfessionalId] {
        match self {
            ServiceSelection::Single(s) => &s.professionals,
            ServiceSelection::Combo(c) => &c.professionals,
        }
    }

    pub fn offered_by(&self, professional_id: ProfessionalId) -> bool {
        self.qualified().contains(&professional_id)
    }
}

/// Services and combos the salon sells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub combos: Vec<ComboDefinition>,
}

impl Catalog {
    pub fn resolve(&self, id: ServiceId) -> Option<ServiceSelection> {
        if let Some(s) = self.services.iter().find(|s| s.id == id) {
            return Some(ServiceSelection::Single(s.clone()));
        }
        self.combos
            .iter()
            .find(|c| c.id == id)
            .map(|c| ServiceSelection::Combo(c.clone()))
    }
}

// ── Booking drafts ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Guest,
    Authenticated,
}

/// An in-progress, uncommitted booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub service: ServiceSelection,
    /// `None` means "any available professional".
    pub professional_id: Option<ProfessionalId>,
    pub date: Option<NaiveDate>,
    pub start: Option<Minute>,
    pub notes: Option<String>,
    pub origin: Origin,
}

impl BookingDraft {
    pub fn new(service: ServiceSelection, origin: Origin) -> Self {
        Self {
            service,
            professional_id: None,
            date: None,
            start: None,
            notes: None,
            origin,
        }
    }

    /// The booked interval; the end is always derived from the service duration.
    pub fn span(&self) -> Result<Span, EngineError> {
        let start = self
            .start
            .ok_or_else(|| EngineError::Format("no start time selected".into()))?;
        Span::from_duration(start, self.service.duration())
    }

    pub fn selected_date(&self) -> Result<NaiveDate, EngineError> {
        self.date
            .ok_or_else(|| EngineError::Format("no date selected".into()))
    }

    pub fn has_slot(&self) -> bool {
        self.date.is_some() && self.start.is_some()
    }

    /// Build the reservation this draft commits as.
    pub fn to_event(
        &self,
        id: EventId,
        professional_id: ProfessionalId,
        date: NaiveDate,
        span: Span,
        customer_id: CustomerId,
        status: ReservationStatus,
    ) -> CalendarEvent {
        let kind = match &self.service {
            ServiceSelection::Single(s) => EventKind::ServiceReservation {
                service_id: s.id,
                customer_id,
                status,
                notes: self.notes.clone(),
            },
            ServiceSelection::Combo(c) => EventKind::ComboReservation {
                combo_id: c.id,
                service_ids: c.services.iter().map(|s| s.id).collect(),
                customer_id,
                status,
                notes: self.notes.clone(),
            },
        };
        CalendarEvent {
            id,
            professional_id,
            date,
            span,
            kind,
        }
    }
}

/// A bookable start time, with the professional it would go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub span: Span,
    pub professional_id: ProfessionalId,
}

/// A customer identity handed over by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub customer_id: CustomerId,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(customer_id: CustomerId) -> Self {
        Self {
            customer_id,
            display_name: None,
        }
    }
}
