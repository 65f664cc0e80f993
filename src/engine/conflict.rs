use crate::limits::MINUTES_PER_DAY;
use crate::model::*;

use super::availability::AvailabilityResult;
use super::occupancy::Occupied;
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Format(format!("interval {span} is empty")));
    }
    if span.end > MINUTES_PER_DAY {
        return Err(EngineError::Format(format!("interval {span} runs past midnight")));
    }
    Ok(())
}

/// First occupied interval overlapping `span`, skipping the event being edited.
pub fn first_conflict<'a>(
    occupied: &'a [Occupied],
    span: &Span,
    exclude: Option<EventId>,
) -> Option<&'a CalendarEvent> {
    conflicts(occupied, span, exclude).next()
}

/// Every occupied interval overlapping `span`, for diagnostics.
pub fn conflicts<'a>(
    occupied: &'a [Occupied],
    span: &Span,
    exclude: Option<EventId>,
) -> impl Iterator<Item = &'a CalendarEvent> + use<'a> {
    let span = *span;
    occupied
        .iter()
        .filter(move |o| Some(o.source.id) != exclude && o.span.overlaps(&span))
        .map(|o| &o.source)
}

pub fn evaluate(occupied: &[Occupied], span: &Span, exclude: Option<EventId>) -> AvailabilityResult {
    match first_conflict(occupied, span, exclude) {
        None => AvailabilityResult::Available,
        Some(event) => AvailabilityResult::Unavailable {
            reason: format!("{span} overlaps {}", event.describe()),
            conflicting_event: Box::new(event.clone()),
        },
    }
}

/// Total occupied minutes; the load measure for assignment.
pub(crate) fn booked_minutes(occupied: &[Occupied]) -> Minute {
    occupied.iter().map(|o| o.span.duration()).sum()
}
