use chrono::{NaiveDate, NaiveDateTime, Timelike};
use tracing::debug;

use crate::config::BusinessHours;
use crate::model::*;

use super::availability::AnyAvailability;
use super::conflict::evaluate;
use super::{Engine, EngineError};

/// Fixed-cadence candidate intervals that fit inside business hours.
///
/// Lazy and restartable: clone it, or call `slot_candidates` again.
#[derive(Debug, Clone)]
pub struct SlotCandidates {
    next: Minute,
    /// Latest start whose interval still ends by closing; `None` if nothing fits.
    last_start: Option<Minute>,
    cadence: Minute,
    duration: Minute,
}

impl Iterator for SlotCandidates {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        let last = self.last_start?;
        if self.next > last {
            return None;
        }
        let span = Span::new(self.next, self.next + self.duration);
        self.next += self.cadence;
        Some(span)
    }
}

pub fn slot_candidates(hours: &BusinessHours, duration: Minute) -> SlotCandidates {
    let last_start = if duration == 0 || hours.cadence == 0 || hours.open >= hours.close {
        None
    } else {
        (hours.close - hours.open)
            .checked_sub(duration)
            .map(|slack| hours.open + slack)
    };
    SlotCandidates {
        next: hours.open,
        last_start,
        cadence: hours.cadence,
        duration,
    }
}

impl Engine {
    /// Bookable slots for `service` on `date`, recomputed from current
    /// occupancy on every call.
    ///
    /// With `professional_id = None` a slot is offered when at least one
    /// qualified professional is free, and names the professional the
    /// assignment policy would pick.
    pub async fn generate_slots(
        &self,
        service: &ServiceSelection,
        date: NaiveDate,
        professional_id: Option<ProfessionalId>,
        now: NaiveDateTime,
    ) -> Result<Vec<Slot>, EngineError> {
        if let Some(pid) = professional_id
            && !service.offered_by(pid)
        {
            return Err(EngineError::NotQualified {
                professional_id: pid,
                service_id: service.id(),
            });
        }

        let hours = &self.config().hours;
        if date < now.date() || hours.is_closed(date) {
            return Ok(Vec::new());
        }
        let earliest = if date == now.date() {
            now.hour() * 60 + now.minute()
        } else {
            0
        };
        let candidates = slot_candidates(hours, service.duration()).filter(|s| s.start >= earliest);

        let slots: Vec<Slot> = match professional_id {
            Some(pid) => {
                let occupied = self.occupied_intervals(pid, date).await?;
                candidates
                    .filter(|span| evaluate(&occupied, span, None).is_available())
                    .map(|span| Slot {
                        span,
                        professional_id: pid,
                    })
                    .collect()
            }
            None => {
                let per_professional = self.occupancy_for(service.qualified(), date).await?;
                let policy = self.config().assignment_policy;
                candidates
                    .filter_map(|span| {
                        AnyAvailability::evaluate(&per_professional, &span)
                            .pick(policy)
                            .map(|pid| Slot {
                                span,
                                professional_id: pid,
                            })
                    })
                    .collect()
            }
        };
        debug!("{} slots for {} on {date}", slots.len(), service.name());
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours(open: Minute, close: Minute, cadence: Minute) -> BusinessHours {
        BusinessHours {
            open,
            close,
            cadence,
            closed_days: Vec::new(),
        }
    }

    #[test]
    fn candidates_step_by_cadence() {
        let starts: Vec<_> = slot_candidates(&hours(540, 660, 30), 30).map(|s| s.start).collect();
        assert_eq!(starts, vec![540, 570, 600, 630]);
    }

    #[test]
    fn last_slot_may_end_at_closing() {
        let spans: Vec<_> = slot_candidates(&hours(540, 660, 30), 60).collect();
        assert_eq!(spans.last(), Some(&Span::new(600, 660)));
        assert!(spans.iter().all(|s| s.end <= 660));
    }

    #[test]
    fn off_cadence_duration_excludes_overrun() {
        // 45-minute service, 30-minute cadence: 10:30 would end at 11:15 > 11:00
        let starts: Vec<_> = slot_candidates(&hours(540, 660, 30), 45).map(|s| s.start).collect();
        assert_eq!(starts, vec![540, 570, 600]);
    }

    #[test]
    fn service_longer_than_day_yields_nothing() {
        assert_eq!(slot_candidates(&hours(540, 600, 30), 90).count(), 0);
        assert_eq!(slot_candidates(&hours(540, 600, 30), 60).count(), 1);
    }

    #[test]
    fn degenerate_hours_yield_nothing() {
        assert_eq!(slot_candidates(&hours(600, 600, 30), 30).count(), 0);
        assert_eq!(slot_candidates(&hours(540, 600, 0), 30).count(), 0);
        assert_eq!(slot_candidates(&hours(540, 600, 30), 0).count(), 0);
    }

    #[test]
    fn candidates_are_restartable() {
        let it = slot_candidates(&hours(540, 720, 30), 30);
        let first: Vec<_> = it.clone().collect();
        let second: Vec<_> = it.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    }
}
