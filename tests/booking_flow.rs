use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use salon_engine::config::EngineConfig;
use salon_engine::engine::{Engine, EngineError, InMemoryStore, RecordStore};
use salon_engine::loyalty::InMemoryLedger;
use salon_engine::model::*;
use salon_engine::notify::{DomainEvent, NotifyHub};
use salon_engine::reconciler::{PendingBookingStore, Reconciler, ReplayResult};
use salon_engine::stash::StashDirectory;
use salon_engine::workflow::{BookingSession, Step, StepInput};

struct Salon {
    engine: Arc<Engine>,
    store: Arc<InMemoryStore>,
    stashes: StashDirectory,
    cut: ServiceSelection,
    anna: ProfessionalId,
    ben: ProfessionalId,
}

fn stash_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("salon_test_flow").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn salon(name: &str) -> Salon {
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(Engine::new(
        store.clone(),
        Arc::new(InMemoryLedger::new()),
        Arc::new(NotifyHub::new()),
        EngineConfig::default(),
    ));
    let (anna, ben) = (Ulid::new(), Ulid::new());
    let cut = ServiceSelection::Single(Service {
        id: Ulid::new(),
        name: "Cut".into(),
        duration: 30,
        professionals: vec![anna, ben],
    });
    Salon {
        engine,
        store,
        stashes: StashDirectory::new(stash_dir(name)).unwrap(),
        cut,
        anna,
        ben,
    }
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 6, 4).unwrap()
}

impl Salon {
    fn reconciler(&self, device: &str) -> Reconciler {
        Reconciler::new(self.engine.clone(), self.stashes.store_for(device).unwrap())
    }

    fn guest_session(&self, pid: Option<ProfessionalId>, start: &str) -> BookingSession {
        let mut session = BookingSession::start(self.cut.clone(), Origin::Guest);
        session.advance(StepInput::Professional(pid)).unwrap();
        session
            .advance(StepInput::DateTime {
                date: date(),
                start: parse_time(start).unwrap(),
            })
            .unwrap();
        session
    }

    async fn day_for(&self, pid: ProfessionalId) -> Vec<CalendarEvent> {
        let mut events = Vec::new();
        for source in EventType::ALL {
            events.extend(self.store.list_events(pid, date(), source).await.unwrap());
        }
        events
    }
}

#[tokio::test]
async fn guest_stash_then_sign_in_books_once() {
    let s = salon("stash_replay");
    let reconciler = s.reconciler("browser-1");
    let mut session = s.guest_session(Some(s.anna), "10:00");

    let err = s.engine.commit(&mut session, None).await.unwrap_err();
    assert!(matches!(err, EngineError::IdentityRequired));

    reconciler.stash_guest_booking(&mut session).await.unwrap();
    assert_eq!(session.step(), Step::Suspended);
    assert!(reconciler.has_pending().await.unwrap());

    let customer = Identity::new(Ulid::new());
    let ReplayResult::Committed(event) = reconciler.try_replay_guest_booking(&customer).await.unwrap()
    else {
        panic!("replay should commit");
    };
    assert_eq!(event.customer_id(), Some(customer.customer_id));
    assert_eq!(event.span, Span::parse("10:00", "10:30").unwrap());
    assert_eq!(s.day_for(s.anna).await, vec![event]);
    assert!(!reconciler.has_pending().await.unwrap());

    assert_eq!(
        reconciler.try_replay_guest_booking(&customer).await.unwrap(),
        ReplayResult::NoOp
    );
    assert_eq!(s.store.event_count(), 1);
}

#[tokio::test]
async fn stash_survives_a_new_directory_handle() {
    let s = salon("reopen");
    let mut session = s.guest_session(None, "11:00");
    s.reconciler("tablet").stash_guest_booking(&mut session).await.unwrap();

    // as after a restart
    let reopened =
        StashDirectory::new(std::env::temp_dir().join("salon_test_flow").join("reopen")).unwrap();
    let pending = reopened.store_for("tablet").unwrap().peek().await.unwrap().unwrap();
    assert_eq!(pending.draft.origin, Origin::Guest);
    assert_eq!(pending.step, Step::CustomerDetails);
    assert_eq!(pending.draft.span().unwrap(), Span::new(660, 690));
}

#[tokio::test]
async fn replay_after_slot_taken_conflicts_and_clears() {
    let s = salon("replay_conflict");
    let reconciler = s.reconciler("phone");
    let mut rx = s.engine.notify.subscribe();

    let mut guest = s.guest_session(Some(s.ben), "14:00");
    reconciler.stash_guest_booking(&mut guest).await.unwrap();

    // another customer books Ben at 14:00 before the guest signs in
    let mut other = BookingSession::start(s.cut.clone(), Origin::Authenticated);
    other.advance(StepInput::Professional(Some(s.ben))).unwrap();
    other
        .advance(StepInput::DateTime {
            date: date(),
            start: 14 * 60,
        })
        .unwrap();
    let taken = s
        .engine
        .commit(&mut other, Some(&Identity::new(Ulid::new())))
        .await
        .unwrap();

    let guest_id = Identity::new(Ulid::new());
    let err = reconciler.try_replay_guest_booking(&guest_id).await.unwrap_err();
    assert_eq!(err.conflicting_event(), Some(&taken));
    assert!(!reconciler.has_pending().await.unwrap());
    assert_eq!(s.day_for(s.ben).await, vec![taken.clone()]);

    let mut saw_rejection = false;
    while let Ok(event) = rx.try_recv() {
        if let DomainEvent::ReplayRejected { customer_id, .. } = event {
            assert_eq!(customer_id, guest_id.customer_id);
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);
}

#[tokio::test]
async fn replay_with_nothing_stashed_writes_nothing() {
    let s = salon("noop");
    let result = s
        .reconciler("fresh-device")
        .try_replay_guest_booking(&Identity::new(Ulid::new()))
        .await
        .unwrap();
    assert_eq!(result, ReplayResult::NoOp);
    assert_eq!(s.store.event_count(), 0);
}

#[tokio::test]
async fn later_stash_overwrites_earlier() {
    let s = salon("overwrite");
    let reconciler = s.reconciler("kiosk");
    let mut first = s.guest_session(Some(s.anna), "09:00");
    let mut second = s.guest_session(Some(s.anna), "16:30");
    reconciler.stash_guest_booking(&mut first).await.unwrap();
    reconciler.stash_guest_booking(&mut second).await.unwrap();

    let ReplayResult::Committed(event) = reconciler
        .try_replay_guest_booking(&Identity::new(Ulid::new()))
        .await
        .unwrap()
    else {
        panic!("replay should commit");
    };
    assert_eq!(event.span, Span::new(990, 1020));
    assert_eq!(s.store.event_count(), 1);
}

#[tokio::test]
async fn devices_stash_independently() {
    let s = salon("devices");
    let mut a = s.guest_session(Some(s.anna), "10:00");
    let mut b = s.guest_session(Some(s.ben), "10:00");
    s.reconciler("a").stash_guest_booking(&mut a).await.unwrap();
    s.reconciler("b").stash_guest_booking(&mut b).await.unwrap();

    assert!(s.reconciler("a").discard().await.unwrap());
    assert!(!s.reconciler("a").has_pending().await.unwrap());
    assert!(s.reconciler("b").has_pending().await.unwrap());
}

#[tokio::test]
async fn slots_shrink_as_bookings_land() {
    let s = salon("slots");
    let now = NaiveDate::from_ymd_opt(2030, 1, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    let before = s
        .engine
        .generate_slots(&s.cut, date(), Some(s.anna), now)
        .await
        .unwrap();
    assert_eq!(before.len(), 18);

    let mut session = BookingSession::start(s.cut.clone(), Origin::Authenticated);
    session.advance(StepInput::Professional(Some(s.anna))).unwrap();
    session
        .advance(StepInput::DateTime {
            date: date(),
            start: before[2].span.start,
        })
        .unwrap();
    s.engine
        .commit(&mut session, Some(&Identity::new(Ulid::new())))
        .await
        .unwrap();

    let after = s
        .engine
        .generate_slots(&s.cut, date(), Some(s.anna), now)
        .await
        .unwrap();
    assert_eq!(after.len(), 17);
    assert!(!after.contains(&before[2]));

    // Ben is still free at that time, so "any" keeps offering it
    let any = s.engine.generate_slots(&s.cut, date(), None, now).await.unwrap();
    assert_eq!(any.len(), 18);
    assert_eq!(any[2].professional_id, s.ben);
}

#[tokio::test]
async fn back_keeps_entered_data() {
    let s = salon("back");
    let mut session = s.guest_session(Some(s.anna), "12:00");
    assert_eq!(session.back().unwrap(), Step::DateTimeSelection);
    assert_eq!(session.back().unwrap(), Step::ProfessionalSelection);
    assert_eq!(session.draft().professional_id, Some(s.anna));
    assert_eq!(session.draft().start, Some(720));

    let other = ServiceSelection::Single(Service {
        id: Ulid::new(),
        name: "Shave".into(),
        duration: 20,
        professionals: vec![s.ben],
    });
    assert_eq!(session.back().unwrap(), Step::ServiceSelection);
    session.advance(StepInput::Service(other)).unwrap();
    // Anna does not shave
    assert_eq!(session.draft().professional_id, None);
    assert_eq!(session.step(), Step::ProfessionalSelection);
}
