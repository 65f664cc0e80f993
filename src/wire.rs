//! JSON-lines gateway: one request object per line in, one response per line out.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, RecordStore};
use crate::limits::MAX_COMBO_SERVICES;
use crate::model::*;
use crate::reconciler::{Reconciler, ReplayResult};
use crate::stash::StashDirectory;
use crate::workflow::{BookingSession, Step, StepInput};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CheckAvailability {
        professional_id: ProfessionalId,
        date: String,
        start: String,
        end: String,
    },
    CheckAnyAvailability {
        service_id: ServiceId,
        date: String,
        start: String,
    },
    Slots {
        service_id: ServiceId,
        date: String,
        #[serde(default)]
        professional_id: Option<ProfessionalId>,
    },
    /// Without a `customer_id` the session is a guest session.
    StartBooking {
        service_id: ServiceId,
        #[serde(default)]
        customer_id: Option<CustomerId>,
    },
    Advance {
        session_id: Ulid,
        input: AdvanceInput,
    },
    Back {
        session_id: Ulid,
    },
    Commit {
        session_id: Ulid,
    },
    Stash {
        session_id: Ulid,
        device_id: String,
    },
    Replay {
        device_id: String,
        customer_id: CustomerId,
        #[serde(default)]
        display_name: Option<String>,
    },
    DiscardStash {
        device_id: String,
    },
    BlockTime {
        professional_id: ProfessionalId,
        date: String,
        start: String,
        end: String,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        recurring: bool,
    },
    SetStatus {
        event_id: EventId,
        status: ReservationStatus,
        actor_id: Ulid,
    },
    Reschedule {
        event_id: EventId,
        date: String,
        start: String,
    },
}

/// Wire form of a workflow step input; services are referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum AdvanceInput {
    Service {
        service_id: ServiceId,
    },
    Professional {
        #[serde(default)]
        professional_id: Option<ProfessionalId>,
    },
    DateTime {
        date: String,
        start: String,
    },
    Details {
        #[serde(default)]
        notes: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub start: String,
    pub end: String,
    pub professional_id: ProfessionalId,
}

impl From<Slot> for SlotView {
    fn from(slot: Slot) -> Self {
        Self {
            start: format_time(slot.span.start),
            end: format_time(slot.span.end),
            professional_id: slot.professional_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub session_id: Ulid,
    pub step: Step,
    pub service: String,
    pub professional_id: Option<ProfessionalId>,
    pub date: Option<NaiveDate>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub notes: Option<String>,
    /// Set after a failed commit.
    pub message: Option<String>,
}

impl SessionView {
    fn new(session_id: Ulid, session: &BookingSession) -> Self {
        let draft = session.draft();
        let span = draft.span().ok();
        Self {
            session_id,
            step: session.step(),
            service: draft.service.name().to_string(),
            professional_id: draft.professional_id,
            date: draft.date,
            start: span.map(|s| format_time(s.start)),
            end: span.map(|s| format_time(s.end)),
            notes: draft.notes.clone(),
            message: session.failure_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Availability {
        available: bool,
        reason: Option<String>,
        conflicting_event: Option<CalendarEvent>,
    },
    AnyAvailability {
        available: bool,
        free: Vec<ProfessionalId>,
        assigned: Option<ProfessionalId>,
    },
    Slots {
        slots: Vec<SlotView>,
    },
    Session(SessionView),
    Event {
        event: CalendarEvent,
    },
    Stashed {
        device_id: String,
    },
    Replay {
        outcome: &'static str,
        event: Option<CalendarEvent>,
        session: Option<SessionView>,
    },
    Discarded {
        removed: bool,
    },
    Error {
        kind: &'static str,
        message: String,
        conflicting_event: Option<CalendarEvent>,
    },
}

impl Response {
    fn error(e: &EngineError) -> Self {
        Response::Error {
            kind: e.kind(),
            message: e.to_string(),
            conflicting_event: e.conflicting_event().cloned(),
        }
    }

    fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Catalog and calendar contents loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub catalog: Catalog,
    #[serde(default)]
    pub events: Vec<CalendarEvent>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Format(format!("cannot read seed {}: {e}", path.display())))?;
        let seed: Seed = serde_json::from_str(&text)
            .map_err(|e| EngineError::Format(format!("bad seed {}: {e}", path.display())))?;
        seed.validate()?;
        Ok(seed)
    }

    fn validate(&self) -> Result<(), EngineError> {
        for combo in &self.catalog.combos {
            if combo.services.is_empty() {
                return Err(EngineError::Format(format!("combo {} has no services", combo.name)));
            }
            if combo.services.len() > MAX_COMBO_SERVICES {
                return Err(EngineError::LimitExceeded("too many services in combo"));
            }
        }
        for event in &self.events {
            Span::try_new(event.span.start, event.span.end).map_err(|e| {
                EngineError::Format(format!("seeded event {}: {e}", event.id))
            })?;
        }
        Ok(())
    }

    /// Insert the seeded events; overlapping ones are rejected like any other write.
    pub async fn apply(&self, store: &dyn RecordStore) -> Result<usize, EngineError> {
        self.validate()?;
        for event in &self.events {
            store.insert_event(event.clone()).await?;
        }
        Ok(self.events.len())
    }
}

struct GatewaySession {
    session: BookingSession,
    identity: Option<Identity>,
}

pub struct Gateway {
    engine: Arc<Engine>,
    catalog: Catalog,
    sessions: DashMap<Ulid, GatewaySession>,
    stashes: Arc<StashDirectory>,
}

impl Gateway {
    pub fn new(engine: Arc<Engine>, catalog: Catalog, stashes: Arc<StashDirectory>) -> Self {
        Self {
            engine,
            catalog,
            sessions: DashMap::new(),
            stashes,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn handle(&self, req: Request) -> Response {
        let op = crate::observability::request_label(&req);
        let response = match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                debug!("{op} failed: {e}");
                Response::error(&e)
            }
        };
        let status = if response.is_error() { "error" } else { "ok" };
        metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status)
            .increment(1);
        response
    }

    async fn dispatch(&self, req: Request) -> Result<Response, EngineError> {
        match req {
            Request::CheckAvailability {
                professional_id,
                date,
                start,
                end,
            } => {
                let result = self
                    .engine
                    .check_availability(professional_id, parse_date(&date)?, Span::parse(&start, &end)?)
                    .await?;
                Ok(Response::Availability {
                    available: result.is_available(),
                    reason: result.reason().map(str::to_string),
                    conflicting_event: result.conflicting_event().cloned(),
                })
            }
            Request::CheckAnyAvailability {
                service_id,
                date,
                start,
            } => {
                let service = self.resolve(service_id)?;
                let span = Span::from_duration(parse_time(&start)?, service.duration())?;
                let any = self
                    .engine
                    .check_any_availability(service.qualified(), parse_date(&date)?, span)
                    .await?;
                Ok(Response::AnyAvailability {
                    available: any.is_available(),
                    free: any.free_professionals(),
                    assigned: any.pick(self.engine.config().assignment_policy),
                })
            }
            Request::Slots {
                service_id,
                date,
                professional_id,
            } => {
                let service = self.resolve(service_id)?;
                let now = chrono::Local::now().naive_local();
                let slots = self
                    .engine
                    .generate_slots(&service, parse_date(&date)?, professional_id, now)
                    .await?;
                Ok(Response::Slots {
                    slots: slots.into_iter().map(SlotView::from).collect(),
                })
            }
            Request::StartBooking {
                service_id,
                customer_id,
            } => {
                let service = self.resolve(service_id)?;
                let origin = match customer_id {
                    Some(_) => Origin::Authenticated,
                    None => Origin::Guest,
                };
                let session_id = Ulid::new();
                let session = BookingSession::start(service, origin);
                let view = SessionView::new(session_id, &session);
                self.sessions.insert(
                    session_id,
                    GatewaySession {
                        session,
                        identity: customer_id.map(Identity::new),
                    },
                );
                Ok(Response::Session(view))
            }
            Request::Advance { session_id, input } => {
                let input = self.step_input(input)?;
                self.with_session(session_id, |entry| {
                    entry.session.advance(input)?;
                    Ok(())
                })
            }
            Request::Back { session_id } => self.with_session(session_id, |entry| {
                entry.session.back()?;
                Ok(())
            }),
            Request::Commit { session_id } => {
                // Take the session out so no other request touches it mid-commit.
                let (_, mut entry) = self
                    .sessions
                    .remove(&session_id)
                    .ok_or(EngineError::NotFound(session_id))?;
                let result = self
                    .engine
                    .commit(&mut entry.session, entry.identity.as_ref())
                    .await;
                self.sessions.insert(session_id, entry);
                let event = result?;
                Ok(Response::Event { event })
            }
            Request::Stash {
                session_id,
                device_id,
            } => {
                let reconciler = self.reconciler(&device_id)?;
                let (_, mut entry) = self
                    .sessions
                    .remove(&session_id)
                    .ok_or(EngineError::NotFound(session_id))?;
                let result = reconciler.stash_guest_booking(&mut entry.session).await;
                self.sessions.insert(session_id, entry);
                result?;
                Ok(Response::Stashed { device_id })
            }
            Request::Replay {
                device_id,
                customer_id,
                display_name,
            } => {
                let identity = Identity {
                    customer_id,
                    display_name,
                };
                let result = self
                    .reconciler(&device_id)?
                    .try_replay_guest_booking(&identity)
                    .await?;
                Ok(match result {
                    ReplayResult::NoOp => replay_response("noop", None, None),
                    ReplayResult::Expired => replay_response("expired", None, None),
                    ReplayResult::Committed(event) => replay_response("committed", Some(event), None),
                    ReplayResult::Resumed(session) => {
                        let session_id = Ulid::new();
                        let view = SessionView::new(session_id, &session);
                        self.sessions.insert(
                            session_id,
                            GatewaySession {
                                session,
                                identity: Some(identity),
                            },
                        );
                        replay_response("resumed", None, Some(view))
                    }
                })
            }
            Request::DiscardStash { device_id } => Ok(Response::Discarded {
                removed: self.reconciler(&device_id)?.discard().await?,
            }),
            Request::BlockTime {
                professional_id,
                date,
                start,
                end,
                reason,
                recurring,
            } => {
                let event = self
                    .engine
                    .block_time(
                        professional_id,
                        parse_date(&date)?,
                        Span::parse(&start, &end)?,
                        reason,
                        recurring,
                    )
                    .await?;
                Ok(Response::Event { event })
            }
            Request::SetStatus {
                event_id,
                status,
                actor_id,
            } => {
                let event = self.engine.set_status(event_id, status, actor_id).await?;
                Ok(Response::Event { event })
            }
            Request::Reschedule {
                event_id,
                date,
                start,
            } => {
                let event = self
                    .engine
                    .reschedule(event_id, parse_date(&date)?, parse_time(&start)?)
                    .await?;
                Ok(Response::Event { event })
            }
        }
    }

    fn resolve(&self, service_id: ServiceId) -> Result<ServiceSelection, EngineError> {
        self.catalog
            .resolve(service_id)
            .ok_or(EngineError::NotFound(service_id))
    }

    fn reconciler(&self, device_id: &str) -> Result<Reconciler, EngineError> {
        Ok(Reconciler::new(self.engine.clone(), self.stashes.store_for(device_id)?))
    }

    fn step_input(&self, input: AdvanceInput) -> Result<StepInput, EngineError> {
        Ok(match input {
            AdvanceInput::Service { service_id } => StepInput::Service(self.resolve(service_id)?),
            AdvanceInput::Professional { professional_id } => StepInput::Professional(professional_id),
            AdvanceInput::DateTime { date, start } => StepInput::DateTime {
                date: parse_date(&date)?,
                start: parse_time(&start)?,
            },
            AdvanceInput::Details { notes } => StepInput::Details { notes },
        })
    }

    /// Apply a synchronous workflow change and report the session afterwards.
    fn with_session(
        &self,
        session_id: Ulid,
        f: impl FnOnce(&mut GatewaySession) -> Result<(), EngineError>,
    ) -> Result<Response, EngineError> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        f(entry.value_mut())?;
        Ok(Response::Session(SessionView::new(session_id, &entry.session)))
    }
}

fn replay_response(
    outcome: &'static str,
    event: Option<CalendarEvent>,
    session: Option<SessionView>,
) -> Response {
    Response::Replay {
        outcome,
        event,
        session,
    }
}

/// Serve requests line by line until the reader is exhausted.
pub async fn process_lines<R, W>(gateway: &Gateway, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut served = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(line) {
            Ok(req) => gateway.handle(req).await,
            Err(e) => Response::error(&EngineError::Format(format!("bad request: {e}"))),
        };
        let mut out = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
        served += 1;
    }
    info!("input closed after {served} requests");
    Ok(())
}
