use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::workflow::{BookingSession, Step};

use super::availability::AvailabilityResult;
use super::conflict::validate_span;
use super::store::{EventPatch, StoreError};
use super::{Engine, EngineError};

impl Engine {
    /// Run the commit protocol for a session at `CustomerDetails`.
    ///
    /// Availability is re-checked even though the slot was offered earlier;
    /// the store's conditional insert then has the final word. On conflict the
    /// session moves to `Failed` with its draft intact. A session that is
    /// already `Confirmed` reports its own reservation as the conflict rather
    /// than booking twice.
    pub async fn commit(
        &self,
        session: &mut BookingSession,
        identity: Option<&Identity>,
    ) -> Result<CalendarEvent, EngineError> {
        if session.step() == Step::Confirmed
            && let Some(own) = session.confirmed_event()
        {
            metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "duplicate").increment(1);
            return Err(EngineError::Conflict(Box::new(own.clone())));
        }
        if session.step() != Step::CustomerDetails {
            return Err(EngineError::InvalidTransition {
                step: session.step(),
                action: "commit",
            });
        }
        let identity = identity.ok_or(EngineError::IdentityRequired)?;

        session.begin_commit()?;
        let started = Instant::now();
        let result = self.commit_draft(session.draft(), identity).await;
        metrics::histogram!(crate::observability::COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(event) => {
                metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "confirmed").increment(1);
                info!(
                    "booking {} confirmed for {} with {} at {} on {}",
                    event.id, identity.customer_id, event.professional_id, event.span, event.date
                );
                session.confirm(event.clone());
                self.after_commit(&event, identity.customer_id, session.draft().service.name())
                    .await;
                Ok(event)
            }
            Err(EngineError::Conflict(conflicting)) => {
                metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "conflict").increment(1);
                info!(
                    "commit for {} rejected: slot taken by {}",
                    identity.customer_id,
                    conflicting.describe()
                );
                session.fail(conflicting.as_ref().clone());
                Err(EngineError::Conflict(conflicting))
            }
            Err(e) => {
                metrics::counter!(crate::observability::COMMITS_TOTAL, "outcome" => "error").increment(1);
                warn!("commit for {} aborted: {e}", identity.customer_id);
                session.abort_commit();
                Err(e)
            }
        }
    }

    /// Re-check and insert. Nothing is written unless the insert succeeds.
    ///
    /// For "any professional" every free candidate is tried in policy order,
    /// so losing a race for one still books another who is free.
    async fn commit_draft(
        &self,
        draft: &BookingDraft,
        identity: &Identity,
    ) -> Result<CalendarEvent, EngineError> {
        let date = draft.selected_date()?;
        let span = draft.span()?;

        let candidates = match draft.professional_id {
            Some(pid) => match self.check_availability(pid, date, span).await? {
                AvailabilityResult::Available => vec![pid],
                AvailabilityResult::Unavailable {
                    conflicting_event, ..
                } => return Err(EngineError::Conflict(conflicting_event)),
            },
            None => {
                let qualified = draft.service.qualified();
                if qualified.is_empty() {
                    return Err(EngineError::NoQualifiedProfessional(draft.service.id()));
                }
                let any = self.check_any_availability(qualified, date, span).await?;
                let ranked = any.ranked(self.config().assignment_policy);
                if ranked.is_empty() {
                    let conflicting = any
                        .first_conflict()
                        .cloned()
                        .ok_or(EngineError::NoQualifiedProfessional(draft.service.id()))?;
                    return Err(EngineError::Conflict(Box::new(conflicting)));
                }
                ranked
            }
        };

        let mut lost_to = None;
        for professional_id in candidates {
            let event = draft.to_event(
                Ulid::new(),
                professional_id,
                date,
                span,
                identity.customer_id,
                self.config().default_status,
            );
            match self.store().insert_event(event.clone()).await {
                Ok(id) => return Ok(CalendarEvent { id, ..event }),
                Err(StoreError::Conflict(existing)) => {
                    debug!("{professional_id} taken at {span} on {date}, trying next");
                    lost_to = Some(existing);
                }
                Err(e) => return Err(e.into()),
            }
        }
        match lost_to {
            Some(existing) => Err(EngineError::Conflict(existing)),
            None => Err(EngineError::NoQualifiedProfessional(draft.service.id())),
        }
    }

    /// Administrative block; occupies time regardless of status.
    pub async fn block_time(
        &self,
        professional_id: ProfessionalId,
        date: NaiveDate,
        span: Span,
        reason: String,
        recurring: bool,
    ) -> Result<CalendarEvent, EngineError> {
        validate_span(&span)?;
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("block reason too long"));
        }
        let event = CalendarEvent {
            id: Ulid::new(),
            professional_id,
            date,
            span,
            kind: EventKind::TimeBlock { reason, recurring },
        };
        let id = self.store().insert_event(event.clone()).await?;
        info!("blocked {span} on {date} for {professional_id}");
        Ok(CalendarEvent { id, ..event })
    }

    /// Move a reservation along its lifecycle. Completing it credits a
    /// loyalty visit through the same path a commit uses.
    ///
    /// The write is conditional on the status read here, so of two racing
    /// changes only one applies; the other sees `InvalidStatusChange`.
    pub async fn set_status(
        &self,
        event_id: EventId,
        status: ReservationStatus,
        actor_id: Ulid,
    ) -> Result<CalendarEvent, EngineError> {
        let mut event = self
            .store()
            .get_event(event_id)
            .await?
            .ok_or(EngineError::NotFound(event_id))?;
        let current = event.status();
        if !current.is_some_and(|from| from.can_become(status)) {
            return Err(EngineError::InvalidStatusChange {
                from: current,
                to: status,
            });
        }

        let patch = EventPatch {
            status: Some(status),
            expected_status: current,
            ..Default::default()
        };
        self.store()
            .update_event(event_id, patch)
            .await
            .map_err(|e| match e {
                StoreError::StatusChanged { actual, .. } => EngineError::InvalidStatusChange {
                    from: actual,
                    to: status,
                },
                e => e.into(),
            })?;
        event.set_status(status);
        info!("event {event_id} is now {status} (by {actor_id})");

        if status == ReservationStatus::Completed {
            self.record_visit(&event, actor_id).await;
        }
        Ok(event)
    }

    /// Move an existing reservation to a new date/start, keeping its duration.
    pub async fn reschedule(
        &self,
        event_id: EventId,
        date: NaiveDate,
        start: Minute,
    ) -> Result<CalendarEvent, EngineError> {
        let mut event = self
            .store()
            .get_event(event_id)
            .await?
            .ok_or(EngineError::NotFound(event_id))?;
        if event.status().is_none_or(ReservationStatus::is_terminal) {
            return Err(EngineError::NotReschedulable(event_id));
        }
        let span = Span::from_duration(start, event.span.duration())?;

        match self
            .check_availability_excluding(event.professional_id, date, span, Some(event_id))
            .await?
        {
            AvailabilityResult::Available => {}
            AvailabilityResult::Unavailable {
                conflicting_event, ..
            } => return Err(EngineError::Conflict(conflicting_event)),
        }

        let patch = EventPatch {
            date: Some(date),
            span: Some(span),
            status: None,
            expected_status: event.status(),
        };
        // the store re-checks overlap and status under its own lock
        self.store()
            .update_event(event_id, patch)
            .await
            .map_err(|e| match e {
                StoreError::StatusChanged { .. } => EngineError::NotReschedulable(event_id),
                e => e.into(),
            })?;
        info!("event {event_id} moved to {span} on {date}");
        event.date = date;
        event.span = span;
        Ok(event)
    }
}
