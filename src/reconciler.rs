use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::DomainEvent;
use crate::workflow::{BookingSession, Step};

/// A guest's booking intent, parked while they sign in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingGuestBooking {
    pub draft: BookingDraft,
    /// The step the guest was on when they left the flow.
    pub step: Step,
    pub stashed_at: DateTime<Utc>,
}

impl PendingGuestBooking {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        // a clock that went backwards reads as fresh
        (now - self.stashed_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }
}

/// Single-slot storage for one device's pending guest booking.
///
/// `take` is read-then-clear: once it returns a record, no later call sees it.
#[async_trait]
pub trait PendingBookingStore: Send + Sync {
    /// Store `pending`, returning whatever it replaced.
    async fn put(&self, pending: PendingGuestBooking) -> Result<Option<PendingGuestBooking>, EngineError>;
    async fn take(&self) -> Result<Option<PendingGuestBooking>, EngineError>;
    async fn peek(&self) -> Result<Option<PendingGuestBooking>, EngineError>;
}

#[derive(Default)]
pub struct MemoryPendingStore {
    slot: Mutex<Option<PendingGuestBooking>>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingBookingStore for MemoryPendingStore {
    async fn put(&self, pending: PendingGuestBooking) -> Result<Option<PendingGuestBooking>, EngineError> {
        Ok(self.slot.lock().await.replace(pending))
    }

    async fn take(&self) -> Result<Option<PendingGuestBooking>, EngineError> {
        Ok(self.slot.lock().await.take())
    }

    async fn peek(&self) -> Result<Option<PendingGuestBooking>, EngineError> {
        Ok(self.slot.lock().await.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
    /// Nothing was stashed.
    NoOp,
    /// The stash outlived its TTL and was dropped unreplayed.
    Expired,
    /// The stash had no complete slot yet; continue the flow from here.
    Resumed(BookingSession),
    Committed(CalendarEvent),
}

impl ReplayResult {
    fn label(&self) -> &'static str {
        match self {
            ReplayResult::NoOp => "noop",
            ReplayResult::Expired => "expired",
            ReplayResult::Resumed(_) => "resumed",
            ReplayResult::Committed(_) => "committed",
        }
    }
}

/// Parks guest bookings and replays them once the customer has an identity.
pub struct Reconciler {
    engine: Arc<Engine>,
    stash: Arc<dyn PendingBookingStore>,
}

impl Reconciler {
    pub fn new(engine: Arc<Engine>, stash: Arc<dyn PendingBookingStore>) -> Self {
        Self { engine, stash }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Park a guest session so the customer can authenticate. Any earlier
    /// stash for this device is replaced.
    pub async fn stash_guest_booking(&self, session: &mut BookingSession) -> Result<(), EngineError> {
        if session.origin() != Origin::Guest {
            return Err(EngineError::NotGuest);
        }
        if !session.step().is_pre_commit() {
            return Err(EngineError::InvalidTransition {
                step: session.step(),
                action: "stash",
            });
        }

        let pending = PendingGuestBooking {
            draft: session.draft().clone(),
            step: session.step(),
            stashed_at: Utc::now(),
        };
        if let Some(previous) = self.stash.put(pending).await? {
            metrics::counter!(crate::observability::STASH_OVERWRITES_TOTAL).increment(1);
            warn!(
                "stash replaced an earlier guest booking for {} stashed at {}",
                previous.draft.service.name(),
                previous.stashed_at
            );
        }
        debug!("stashed guest booking at step {:?}", session.step());
        session.suspend();
        Ok(())
    }

    /// Drop the stashed intent without replaying it.
    pub async fn discard(&self) -> Result<bool, EngineError> {
        Ok(self.stash.take().await?.is_some())
    }

    pub async fn has_pending(&self) -> Result<bool, EngineError> {
        Ok(self.stash.peek().await?.is_some())
    }

    /// Called once the customer is authenticated. The stash is consumed before
    /// anything else happens and is never put back, whatever the outcome.
    pub async fn try_replay_guest_booking(&self, identity: &Identity) -> Result<ReplayResult, EngineError> {
        let result = self.replay(identity).await;
        let outcome = match &result {
            Ok(r) => r.label(),
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::REPLAYS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn replay(&self, identity: &Identity) -> Result<ReplayResult, EngineError> {
        let Some(pending) = self.stash.take().await? else {
            return Ok(ReplayResult::NoOp);
        };
        if pending.is_expired(Utc::now(), self.engine.config().stash_ttl) {
            info!(
                "discarded expired guest booking stashed at {} for {}",
                pending.stashed_at, identity.customer_id
            );
            return Ok(ReplayResult::Expired);
        }

        let mut draft = pending.draft;
        draft.origin = Origin::Authenticated;
        let mut session = BookingSession::resume(draft, pending.step);
        if session.step() != Step::CustomerDetails {
            info!(
                "resumed guest booking for {} at step {:?}",
                identity.customer_id,
                session.step()
            );
            return Ok(ReplayResult::Resumed(session));
        }

        match self.engine.commit(&mut session, Some(identity)).await {
            Ok(event) => {
                info!("replayed guest booking {} for {}", event.id, identity.customer_id);
                Ok(ReplayResult::Committed(event))
            }
            Err(EngineError::Conflict(conflicting)) => {
                warn!(
                    "replay for {} lost its slot to {}",
                    identity.customer_id,
                    conflicting.describe()
                );
                self.engine.notify.publish(DomainEvent::ReplayRejected {
                    customer_id: identity.customer_id,
                    conflicting: conflicting.as_ref().clone(),
                });
                Err(EngineError::Conflict(conflicting))
            }
            Err(e) => {
                warn!("replay for {} failed: {e}", identity.customer_id);
                Err(e)
            }
        }
    }
}

/// Replay on every "became authenticated" signal from the identity provider.
pub async fn run_replay_listener(reconciler: Arc<Reconciler>, mut signals: mpsc::Receiver<Identity>) {
    while let Some(identity) = signals.recv().await {
        match reconciler.try_replay_guest_booking(&identity).await {
            Ok(ReplayResult::NoOp) => {}
            Ok(result) => debug!("replay for {}: {}", identity.customer_id, result.label()),
            Err(e) => warn!("replay for {}: {e}", identity.customer_id),
        }
    }
    debug!("replay listener stopped");
}
