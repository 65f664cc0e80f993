use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::MAX_NOTES_LEN;
use crate::model::*;

/// Where a booking session is in the wizard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ServiceSelection,
    ProfessionalSelection,
    DateTimeSelection,
    CustomerDetails,
    Committing,
    Confirmed,
    /// The final availability re-check or the store rejected the slot.
    Failed,
    /// Handed to the reconciler while the guest signs in.
    Suspended,
}

impl Step {
    /// Target of a "back" transition. `Failed` returns to slot selection,
    /// since the slot it failed on is known to be taken.
    pub fn previous(self) -> Option<Step> {
        match self {
            Step::ProfessionalSelection => Some(Step::ServiceSelection),
            Step::DateTimeSelection => Some(Step::ProfessionalSelection),
            Step::CustomerDetails => Some(Step::DateTimeSelection),
            Step::Failed => Some(Step::DateTimeSelection),
            Step::ServiceSelection | Step::Committing | Step::Confirmed | Step::Suspended => None,
        }
    }

    /// Steps a guest may stash from.
    pub fn is_pre_commit(self) -> bool {
        matches!(
            self,
            Step::ServiceSelection
                | Step::ProfessionalSelection
                | Step::DateTimeSelection
                | Step::CustomerDetails
        )
    }
}

/// Data entered at one wizard step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepInput {
    Service(ServiceSelection),
    /// `None` = any available professional.
    Professional(Option<ProfessionalId>),
    DateTime { date: NaiveDate, start: Minute },
    Details { notes: Option<String> },
}

impl StepInput {
    fn action(&self) -> &'static str {
        match self {
            StepInput::Service(_) => "select a service",
            StepInput::Professional(_) => "select a professional",
            StepInput::DateTime { .. } => "select a date and time",
            StepInput::Details { .. } => "enter customer details",
        }
    }
}

/// One customer's booking attempt. Owns its draft for the whole session;
/// going back never discards what was already entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSession {
    step: Step,
    draft: BookingDraft,
    conflict: Option<CalendarEvent>,
    confirmed: Option<CalendarEvent>,
}

impl BookingSession {
    /// A draft exists once a service is picked; the next step is choosing a professional.
    pub fn start(service: ServiceSelection, origin: Origin) -> Self {
        Self {
            step: Step::ProfessionalSelection,
            draft: BookingDraft::new(service, origin),
            conflict: None,
            confirmed: None,
        }
    }

    /// Rebuild a session from a stashed draft at the step it was stashed at.
    pub fn resume(draft: BookingDraft, step: Step) -> Self {
        let step = match step {
            Step::CustomerDetails if !draft.has_slot() => Step::DateTimeSelection,
            s if s.is_pre_commit() => s,
            _ if draft.has_slot() => Step::CustomerDetails,
            _ => Step::DateTimeSelection,
        };
        Self {
            step,
            draft,
            conflict: None,
            confirmed: None,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn draft(&self) -> &BookingDraft {
        &self.draft
    }

    pub fn origin(&self) -> Origin {
        self.draft.origin
    }

    /// The event that made the last commit fail.
    pub fn conflict(&self) -> Option<&CalendarEvent> {
        self.conflict.as_ref()
    }

    pub fn confirmed_event(&self) -> Option<&CalendarEvent> {
        self.confirmed.as_ref()
    }

    /// Message to show alongside the preserved draft after a failed commit.
    pub fn failure_message(&self) -> Option<String> {
        let conflict = self.conflict.as_ref()?;
        let slot = match (self.draft.date, self.draft.span()) {
            (Some(date), Ok(span)) => format!("{span} on {date}"),
            _ => "the selected slot".to_string(),
        };
        Some(format!(
            "{slot} is no longer available ({}); please choose another time",
            conflict.describe()
        ))
    }

    /// Record the input for the current step and move forward.
    pub fn advance(&mut self, input: StepInput) -> Result<Step, EngineError> {
        match (self.step, input) {
            (Step::ServiceSelection, StepInput::Service(service)) => {
                if let Some(pid) = self.draft.professional_id
                    && !service.offered_by(pid)
                {
                    self.draft.professional_id = None;
                }
                self.draft.service = service;
                self.step = Step::ProfessionalSelection;
            }
            (Step::ProfessionalSelection, StepInput::Professional(choice)) => {
                if let Some(pid) = choice
                    && !self.draft.service.offered_by(pid)
                {
                    return Err(EngineError::NotQualified {
                        professional_id: pid,
                        service_id: self.draft.service.id(),
                    });
                }
                self.draft.professional_id = choice;
                self.step = Step::DateTimeSelection;
            }
            (Step::DateTimeSelection, StepInput::DateTime { date, start }) => {
                Span::from_duration(start, self.draft.service.duration())?;
                self.draft.date = Some(date);
                self.draft.start = Some(start);
                self.step = Step::CustomerDetails;
            }
            (Step::CustomerDetails, StepInput::Details { notes }) => {
                let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
                if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
                    return Err(EngineError::LimitExceeded("notes too long"));
                }
                self.draft.notes = notes;
            }
            (step, input) => {
                return Err(EngineError::InvalidTransition {
                    step,
                    action: input.action(),
                });
            }
        }
        Ok(self.step)
    }

    /// Return to the previous step, keeping the draft intact.
    pub fn back(&mut self) -> Result<Step, EngineError> {
        let previous = self.step.previous().ok_or(EngineError::InvalidTransition {
            step: self.step,
            action: "go back",
        })?;
        self.conflict = None;
        self.step = previous;
        Ok(previous)
    }

    // ── Commit protocol hooks (driven by `Engine::commit`) ──────

    pub(crate) fn begin_commit(&mut self) -> Result<(), EngineError> {
        if self.step != Step::CustomerDetails {
            return Err(EngineError::InvalidTransition {
                step: self.step,
                action: "commit",
            });
        }
        self.step = Step::Committing;
        Ok(())
    }

    pub(crate) fn confirm(&mut self, event: CalendarEvent) {
        self.conflict = None;
        self.confirmed = Some(event);
        self.step = Step::Confirmed;
    }

    pub(crate) fn fail(&mut self, conflicting: CalendarEvent) {
        self.conflict = Some(conflicting);
        self.step = Step::Failed;
    }

    /// A transient error interrupted the commit; nothing was written.
    pub(crate) fn abort_commit(&mut self) {
        self.step = Step::CustomerDetails;
    }

    pub(crate) fn suspend(&mut self) {
        self.step = Step::Suspended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn service(professionals: Vec<ProfessionalId>) -> ServiceSelection {
        ServiceSelection::Single(Service {
            id: Ulid::new(),
            name: "Cut".into(),
            duration: 30,
            professionals,
        })
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn filled_session(pid: ProfessionalId) -> BookingSession {
        let mut session = BookingSession::start(service(vec![pid]), Origin::Authenticated);
        session.advance(StepInput::Professional(Some(pid))).unwrap();
        session
            .advance(StepInput::DateTime { date: day(), start: 600 })
            .unwrap();
        session
    }

    #[test]
    fn forward_path() {
        let pid = Ulid::new();
        let mut session = BookingSession::start(service(vec![pid]), Origin::Guest);
        assert_eq!(session.step(), Step::ProfessionalSelection);
        assert_eq!(session.advance(StepInput::Professional(None)).unwrap(), Step::DateTimeSelection);
        assert_eq!(
            session.advance(StepInput::DateTime { date: day(), start: 600 }).unwrap(),
            Step::CustomerDetails
        );
        assert_eq!(
            session.advance(StepInput::Details { notes: Some("  short  ".into()) }).unwrap(),
            Step::CustomerDetails
        );
        assert_eq!(session.draft().notes.as_deref(), Some("short"));
        assert_eq!(session.draft().span().unwrap(), Span::new(600, 630));
    }

    #[test]
    fn back_preserves_draft() {
        let pid = Ulid::new();
        let mut session = filled_session(pid);
        session
            .advance(StepInput::Details { notes: Some("allergic to dye".into()) })
            .unwrap();

        assert_eq!(session.back().unwrap(), Step::DateTimeSelection);
        assert_eq!(session.back().unwrap(), Step::ProfessionalSelection);
        assert_eq!(session.back().unwrap(), Step::ServiceSelection);
        assert!(session.back().is_err());

        let draft = session.draft();
        assert_eq!(draft.professional_id, Some(pid));
        assert_eq!(draft.date, Some(day()));
        assert_eq!(draft.start, Some(600));
        assert_eq!(draft.notes.as_deref(), Some("allergic to dye"));
    }

    #[test]
    fn out_of_order_input_rejected() {
        let pid = Ulid::new();
        let mut session = BookingSession::start(service(vec![pid]), Origin::Guest);
        let err = session
            .advance(StepInput::DateTime { date: day(), start: 600 })
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { step: Step::ProfessionalSelection, .. }
        ));
        assert_eq!(session.step(), Step::ProfessionalSelection);
    }

    #[test]
    fn unqualified_professional_rejected() {
        let mut session = BookingSession::start(service(vec![Ulid::new()]), Origin::Guest);
        let err = session
            .advance(StepInput::Professional(Some(Ulid::new())))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotQualified { .. }));
        assert_eq!(session.step(), Step::ProfessionalSelection);
    }

    #[test]
    fn changing_service_drops_only_unqualified_professional() {
        let pid = Ulid::new();
        let mut session = filled_session(pid);
        session.back().unwrap();
        session.back().unwrap();
        session.back().unwrap();

        session.advance(StepInput::Service(service(vec![pid]))).unwrap();
        assert_eq!(session.draft().professional_id, Some(pid));

        session.back().unwrap();
        session.advance(StepInput::Service(service(vec![Ulid::new()]))).unwrap();
        assert_eq!(session.draft().professional_id, None);
        assert_eq!(session.draft().date, Some(day()));
    }

    #[test]
    fn slot_must_fit_in_day() {
        let pid = Ulid::new();
        let mut session = BookingSession::start(service(vec![pid]), Origin::Guest);
        session.advance(StepInput::Professional(None)).unwrap();
        let err = session
            .advance(StepInput::DateTime { date: day(), start: 1430 })
            .unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
        assert_eq!(session.step(), Step::DateTimeSelection);
    }

    #[test]
    fn notes_limit() {
        let mut session = filled_session(Ulid::new());
        let err = session
            .advance(StepInput::Details { notes: Some("x".repeat(MAX_NOTES_LEN + 1)) })
            .unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
        session.advance(StepInput::Details { notes: Some("   ".into()) }).unwrap();
        assert_eq!(session.draft().notes, None);
    }

    #[test]
    fn failed_goes_back_to_slot_selection() {
        let pid = Ulid::new();
        let mut session = filled_session(pid);
        session.begin_commit().unwrap();
        let blocker = session.draft().to_event(
            Ulid::new(),
            pid,
            day(),
            Span::new(600, 630),
            Ulid::new(),
            ReservationStatus::Confirmed,
        );
        session.fail(blocker);
        assert_eq!(session.step(), Step::Failed);
        let msg = session.failure_message().unwrap();
        assert!(msg.contains("10:00-10:30 on 2025-03-10"), "{msg}");
        assert!(msg.contains("no longer available"));

        assert_eq!(session.back().unwrap(), Step::DateTimeSelection);
        assert!(session.conflict().is_none());
        assert_eq!(session.draft().start, Some(600));
    }

    #[test]
    fn commit_only_from_customer_details() {
        let mut session = BookingSession::start(service(vec![Ulid::new()]), Origin::Guest);
        assert!(session.begin_commit().is_err());
        let mut session = filled_session(Ulid::new());
        session.begin_commit().unwrap();
        assert_eq!(session.step(), Step::Committing);
        assert!(session.back().is_err());
        session.abort_commit();
        assert_eq!(session.step(), Step::CustomerDetails);
    }

    #[test]
    fn resume_lands_on_a_reachable_step() {
        let pid = Ulid::new();
        let full = filled_session(pid).draft().clone();
        assert_eq!(BookingSession::resume(full.clone(), Step::CustomerDetails).step(), Step::CustomerDetails);
        assert_eq!(BookingSession::resume(full.clone(), Step::Suspended).step(), Step::CustomerDetails);

        let partial = BookingDraft::new(service(vec![pid]), Origin::Guest);
        assert_eq!(
            BookingSession::resume(partial.clone(), Step::CustomerDetails).step(),
            Step::DateTimeSelection
        );
        assert_eq!(
            BookingSession::resume(partial, Step::ProfessionalSelection).step(),
            Step::ProfessionalSelection
        );
    }
}
