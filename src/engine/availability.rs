use chrono::NaiveDate;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::limits::MAX_QUALIFIED_PROFESSIONALS;
use crate::model::*;

use super::conflict::{booked_minutes, evaluate, validate_span};
use super::occupancy::Occupied;
use super::{Engine, EngineError};

/// Outcome of checking one professional. An unavailable result always
/// carries both the conflicting event and a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityResult {
    Available,
    Unavailable {
        conflicting_event: Box<CalendarEvent>,
        reason: String,
    },
}

impl AvailabilityResult {
    pub fn is_available(&self) -> bool {
        matches!(self, AvailabilityResult::Available)
    }

    pub fn conflicting_event(&self) -> Option<&CalendarEvent> {
        match self {
            AvailabilityResult::Available => None,
            AvailabilityResult::Unavailable {
                conflicting_event, ..
            } => Some(conflicting_event.as_ref()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            AvailabilityResult::Available => None,
            AvailabilityResult::Unavailable { reason, .. } => Some(reason),
        }
    }
}

/// How a booking for "any available" professional is assigned.
///
/// `FirstQualified`: the first free professional in catalog order.
/// `LeastLoaded`: the free professional with the fewest occupied minutes
/// that day, ties broken by catalog order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    #[default]
    FirstQualified,
    LeastLoaded,
}

impl AssignmentPolicy {
    pub fn pick(self, free: &[Candidate]) -> Option<ProfessionalId> {
        let chosen = match self {
            AssignmentPolicy::FirstQualified => free.first(),
            AssignmentPolicy::LeastLoaded => free
                .iter()
                .enumerate()
                .min_by_key(|(order, c)| (c.booked_minutes, *order))
                .map(|(_, c)| c),
        };
        chosen.map(|c| c.professional_id)
    }
}

impl std::str::FromStr for AssignmentPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first_qualified" => Ok(AssignmentPolicy::FirstQualified),
            "least_loaded" | "least-loaded" => Ok(AssignmentPolicy::LeastLoaded),
            other => Err(EngineError::Format(format!("unknown assignment policy: {other:?}"))),
        }
    }
}

/// A professional who is free for the requested interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub professional_id: ProfessionalId,
    pub booked_minutes: Minute,
}

/// Result of the "any available" check: who is free, and why the rest are not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnyAvailability {
    /// In catalog order.
    pub free: Vec<Candidate>,
    pub conflicts: Vec<(ProfessionalId, CalendarEvent)>,
}

impl AnyAvailability {
    pub fn is_available(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn free_professionals(&self) -> Vec<ProfessionalId> {
        self.free.iter().map(|c| c.professional_id).collect()
    }

    pub fn pick(&self, policy: AssignmentPolicy) -> Option<ProfessionalId> {
        policy.pick(&self.free)
    }

    /// Every free professional, best first under `policy`.
    pub fn ranked(&self, policy: AssignmentPolicy) -> Vec<ProfessionalId> {
        let mut order: Vec<(usize, &Candidate)> = self.free.iter().enumerate().collect();
        if policy == AssignmentPolicy::LeastLoaded {
            order.sort_by_key(|(i, c)| (c.booked_minutes, *i));
        }
        order.into_iter().map(|(_, c)| c.professional_id).collect()
    }

    pub fn first_conflict(&self) -> Option<&CalendarEvent> {
        self.conflicts.first().map(|(_, e)| e)
    }

    /// Evaluate one interval against pre-aggregated occupancy per professional.
    pub(crate) fn evaluate(per_professional: &[(ProfessionalId, Vec<Occupied>)], span: &Span) -> Self {
        let mut result = AnyAvailability::default();
        for (pid, occupied) in per_professional {
            match evaluate(occupied, span, None) {
                AvailabilityResult::Available => result.free.push(Candidate {
                    professional_id: *pid,
                    booked_minutes: booked_minutes(occupied),
                }),
                AvailabilityResult::Unavailable {
                    conflicting_event, ..
                } => result.conflicts.push((*pid, *conflicting_event)),
            }
        }
        result
    }
}

/// Deduplicate while keeping catalog order.
pub(crate) fn distinct(qualified: &[ProfessionalId]) -> Result<Vec<ProfessionalId>, EngineError> {
    if qualified.len() > MAX_QUALIFIED_PROFESSIONALS {
        return Err(EngineError::LimitExceeded("too many qualified professionals"));
    }
    let mut out: Vec<ProfessionalId> = Vec::with_capacity(qualified.len());
    for pid in qualified {
        if !out.contains(pid) {
            out.push(*pid);
        }
    }
    Ok(out)
}

impl Engine {
    pub async fn check_availability(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
        span: Span,
    ) -> Result<AvailabilityResult, EngineError> {
        self.check_availability_excluding(professional_id, date, span, None)
            .await
    }

    /// Same as `check_availability`, ignoring `exclude` (an appointment being edited).
    pub async fn check_availability_excluding(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
        span: Span,
        exclude: Option<EventId>,
    ) -> Result<AvailabilityResult, EngineError> {
        validate_span(&span)?;
        let occupied = self.occupied_intervals(professional_id, date).await?;
        let result = evaluate(&occupied, &span, exclude);
        let label = if result.is_available() { "available" } else { "conflict" };
        metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => label)
            .increment(1);
        Ok(result)
    }

    /// The "any available" variant: which qualified professionals are free.
    pub async fn check_any_availability(
        &self,
        qualified: &[ProfessionalId],
        date: NaiveDate,
        span: Span,
    ) -> Result<AnyAvailability, EngineError> {
        validate_span(&span)?;
        let per_professional = self.occupancy_for(qualified, date).await?;
        let result = AnyAvailability::evaluate(&per_professional, &span);
        let label = if result.is_available() { "available" } else { "conflict" };
        metrics::counter!(crate::observability::AVAILABILITY_CHECKS_TOTAL, "result" => label)
            .increment(1);
        Ok(result)
    }

    /// Aggregate occupancy for several professionals concurrently, in input order.
    pub(crate) async fn occupancy_for(
        &self,
        qualified: &[ProfessionalId],
        date: NaiveDate,
    ) -> Result<Vec<(ProfessionalId, Vec<Occupied>)>, EngineError> {
        let professionals = distinct(qualified)?;
        let occupancy = try_join_all(
            professionals
                .iter()
                .map(|&pid| self.occupied_intervals(pid, date)),
        )
        .await?;
        Ok(professionals.into_iter().zip(occupancy).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn candidate(booked_minutes: Minute) -> Candidate {
        Candidate {
            professional_id: Ulid::new(),
            booked_minutes,
        }
    }

    #[test]
    fn first_qualified_takes_catalog_order() {
        let free = vec![candidate(120), candidate(0)];
        assert_eq!(
            AssignmentPolicy::FirstQualified.pick(&free),
            Some(free[0].professional_id)
        );
    }

    #[test]
    fn least_loaded_breaks_ties_by_order() {
        let free = vec![candidate(60), candidate(30), candidate(30)];
        assert_eq!(
            AssignmentPolicy::LeastLoaded.pick(&free),
            Some(free[1].professional_id)
        );
    }

    #[test]
    fn pick_from_nobody() {
        assert_eq!(AssignmentPolicy::FirstQualified.pick(&[]), None);
        assert_eq!(AssignmentPolicy::LeastLoaded.pick(&[]), None);
    }

    #[test]
    fn policy_parses() {
        assert_eq!("first".parse::<AssignmentPolicy>().unwrap(), AssignmentPolicy::FirstQualified);
        assert_eq!("least_loaded".parse::<AssignmentPolicy>().unwrap(), AssignmentPolicy::LeastLoaded);
        assert!("random".parse::<AssignmentPolicy>().is_err());
    }

    #[test]
    fn distinct_keeps_first_occurrence() {
        let a = Ulid::new();
        let b = Ulid::new();
        assert_eq!(distinct(&[a, b, a]).unwrap(), vec![a, b]);
        let many = vec![Ulid::new(); MAX_QUALIFIED_PROFESSIONALS + 1];
        assert!(distinct(&many).is_err());
    }

    #[test]
    fn unavailable_always_has_reason() {
        let r = AvailabilityResult::Available;
        assert!(r.is_available());
        assert!(r.reason().is_none());
        assert!(r.conflicting_event().is_none());
    }
}
