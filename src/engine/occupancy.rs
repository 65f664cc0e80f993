use chrono::NaiveDate;
use tracing::{debug, error};

use crate::model::*;

use super::{Engine, EngineError};

/// An interval during which a professional cannot take a new booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupied {
    pub span: Span,
    pub source: CalendarEvent,
}

/// Keep only events that occupy time, sorted by start for deterministic output.
pub fn collect_occupied(events: impl IntoIterator<Item = CalendarEvent>) -> Vec<Occupied> {
    let mut occupied: Vec<Occupied> = events
        .into_iter()
        .filter(CalendarEvent::occupies)
        .map(|e| Occupied { span: e.span, source: e })
        .collect();
    occupied.sort_by_key(|o| (o.span.start, o.span.end));
    occupied
}

impl Engine {
    /// Union of occupied intervals from all three event sources.
    ///
    /// The three queries run concurrently; if any one fails the whole
    /// aggregation fails, since a partial answer would under-report occupancy.
    pub async fn occupied_intervals(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
    ) -> Result<Vec<Occupied>, EngineError> {
        let (services, combos, blocks) = futures::try_join!(
            self.list_source(professional_id, date, EventType::Service),
            self.list_source(professional_id, date, EventType::Combo),
            self.list_source(professional_id, date, EventType::Block),
        )?;
        let occupied = collect_occupied(services.into_iter().chain(combos).chain(blocks));
        debug!(
            "professional {professional_id} on {date}: {} occupied intervals",
            occupied.len()
        );
        Ok(occupied)
    }

    async fn list_source(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
        source: EventType,
    ) -> Result<Vec<CalendarEvent>, EngineError> {
        self.store
            .list_events(professional_id, date, source)
            .await
            .map_err(|e| {
                metrics::counter!(
                    crate::observability::AGGREGATION_FAILURES_TOTAL,
                    "source" => source.label()
                )
                .increment(1);
                error!(
                    "{} query failed for professional {professional_id} on {date}: {e}",
                    source.label()
                );
                EngineError::PartialAggregation {
                    source,
                    reason: e.to_string(),
                }
            })
    }
}
