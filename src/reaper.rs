use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::stash::StashDirectory;

/// Background task that periodically deletes stashes older than `ttl`.
pub async fn run_stash_reaper(stashes: Arc<StashDirectory>, ttl: Duration, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match stashes.reap_expired(Utc::now(), ttl).await {
            Ok(0) => {}
            Ok(n) => {
                metrics::counter!(crate::observability::STASHES_REAPED_TOTAL).increment(n as u64);
            }
            Err(e) => warn!("stash reaper pass failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::reconciler::{PendingBookingStore, PendingGuestBooking};
    use crate::workflow::Step;
    use ulid::Ulid;

    #[tokio::test]
    async fn reaper_clears_expired_stash() {
        let dir = std::env::temp_dir().join("salon_test_reaper");
        let _ = std::fs::remove_dir_all(&dir);
        let stashes = Arc::new(StashDirectory::new(dir.clone()).unwrap());

        let service = ServiceSelection::Single(Service {
            id: Ulid::new(),
            name: "Cut".into(),
            duration: 30,
            professionals: vec![],
        });
        stashes
            .store_for("tablet")
            .unwrap()
            .put(PendingGuestBooking {
                draft: BookingDraft::new(service, Origin::Guest),
                step: Step::ProfessionalSelection,
                stashed_at: Utc::now() - chrono::Duration::minutes(10),
            })
            .await
            .unwrap();

        let reaper = tokio::spawn(run_stash_reaper(
            stashes.clone(),
            Duration::from_secs(60),
            Duration::from_millis(10),
        ));
        for _ in 0..100 {
            if !dir.join("tablet.stash").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reaper.abort();
        assert!(!dir.join("tablet.stash").exists());
    }
}
